//! Configuration for the demo driver.
//!
//! An optional `overcast.toml` supplies defaults; CLI flags override it
//! field by field. Unknown fields are ignored so the file can grow without
//! breaking older binaries.

use anyhow::{Context, Result, bail};
use core_compose::{GatherMode, MergeMode, PixelLayout};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub image: ImageSection,
    #[serde(default)]
    pub compose: ComposeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSection {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeSection {
    pub ranks: usize,
    pub layout: String,
    pub merge: String,
    pub gather: String,
}

impl Default for ComposeSection {
    fn default() -> Self {
        Self {
            ranks: 8,
            layout: "rgba32".into(),
            merge: "alpha".into(),
            gather: "gatherv".into(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: FileConfig =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        tracing::info!(
            target: "runtime.config",
            path = %path.display(),
            width = cfg.image.width,
            height = cfg.image.height,
            ranks = cfg.compose.ranks,
            "config loaded"
        );
        Ok(cfg)
    }
}

pub fn parse_layout(name: &str) -> Result<PixelLayout> {
    Ok(match name {
        "rgba32" => PixelLayout::Rgba32,
        "rgba56" => PixelLayout::Rgba56,
        "rgba64" => PixelLayout::Rgba64,
        "rgbaz64" => PixelLayout::Rgbaz64,
        "rgbaz88" => PixelLayout::Rgbaz88,
        "rgbaz96" => PixelLayout::Rgbaz96,
        "rgba128" => PixelLayout::Rgba128,
        "rgbaz160" => PixelLayout::Rgbaz160,
        other => bail!("unknown pixel layout {other:?}"),
    })
}

pub fn parse_merge(name: &str) -> Result<MergeMode> {
    Ok(match name {
        "alpha" => MergeMode::Alpha,
        "depth" => MergeMode::Depth,
        other => bail!("unknown merge mode {other:?}"),
    })
}

pub fn parse_gather(name: &str) -> Result<GatherMode> {
    Ok(match name {
        "gather" => GatherMode::Gather,
        "gatherv" => GatherMode::Gatherv,
        other => bail!("unknown gather mode {other:?}"),
    })
}
