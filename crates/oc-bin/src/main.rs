//! Overcast demo driver.
//!
//! Stands up an in-process rank group, gives every rank a synthetic
//! partial render of the same viewport, composites them with the
//! configured schedule and reports what root received. Useful as a smoke
//! test and as a template for wiring the engine to a real process group.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::FileConfig;
use core_compose::{Communicator, Compositor, LocalGroup, MergeMode, PixelLayout};
use core_pixel::write_f32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments; every flag overrides the corresponding config field.
#[derive(Parser, Debug)]
#[command(name = "overcast", version, about = "Sort-last compositing demo")]
struct Args {
    /// Optional configuration file (defaults to ./overcast.toml if present).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Number of ranks in the in-process group.
    #[arg(long)]
    ranks: Option<usize>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Pixel layout: rgba32, rgba56, rgba64, rgbaz64, rgbaz88, rgbaz96,
    /// rgba128, rgbaz160.
    #[arg(long)]
    layout: Option<String>,
    /// Merge mode: alpha or depth.
    #[arg(long)]
    merge: Option<String>,
    /// Gather mode: gather or gatherv.
    #[arg(long)]
    gather: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn configure_logging(log_file: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().map(|s| s.to_owned()).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            None
        }
    }
}

/// One rank's synthetic partial render: a translucent horizontal band at a
/// rank-specific height, premultiplied, with the rank's depth plane.
fn render_band(
    rank: usize,
    nranks: usize,
    width: u32,
    height: u32,
    layout: PixelLayout,
) -> (Vec<u8>, Vec<f32>) {
    let (w, h) = (width as usize, height as usize);
    let npixels = w * h;
    let band_rows = (h / nranks).max(1);
    let band_top = (rank * band_rows).min(h.saturating_sub(band_rows));

    let bpp = layout.bytes_per_pixel();
    let mut image = vec![0u8; npixels * bpp];
    let depth_plane = 1.0 + rank as f32 * 0.5;
    let depth = vec![depth_plane; npixels];

    // Pixels outside the band are background: transparent and far away.
    if let Some(zoff) = layout.spec().depth_offset {
        for px in image.chunks_exact_mut(bpp) {
            write_f32(px, zoff, f32::MAX);
        }
    }

    // A premultiplied 60% band, tinted per rank.
    let alpha = 0.6f32;
    let tint = [
        (((rank * 97) % 200 + 55) as f32 / 255.0) * alpha,
        (((rank * 57) % 200 + 55) as f32 / 255.0) * alpha,
        (((rank * 17) % 200 + 55) as f32 / 255.0) * alpha,
    ];

    for row in band_top..(band_top + band_rows).min(h) {
        for col in 0..w {
            let px = &mut image[(row * w + col) * bpp..(row * w + col + 1) * bpp];
            match layout {
                PixelLayout::Rgba32 | PixelLayout::Rgbaz64 => {
                    for c in 0..3 {
                        px[c] = (tint[c] * 255.0).round() as u8;
                    }
                    px[3] = (alpha * 255.0).round() as u8;
                    if layout == PixelLayout::Rgbaz64 {
                        write_f32(px, 4, depth_plane);
                    }
                }
                PixelLayout::Rgba56 | PixelLayout::Rgbaz88 => {
                    for c in 0..3 {
                        px[c] = (tint[c] * 255.0).round() as u8;
                    }
                    write_f32(px, 3, alpha);
                    if layout == PixelLayout::Rgbaz88 {
                        write_f32(px, 7, depth_plane);
                    }
                }
                PixelLayout::Rgba64 | PixelLayout::Rgbaz96 => {
                    for c in 0..3 {
                        px[c] = (tint[c] * 255.0).round() as u8;
                    }
                    write_f32(px, 4, alpha);
                    if layout == PixelLayout::Rgbaz96 {
                        write_f32(px, 8, depth_plane);
                    }
                }
                PixelLayout::Rgba128 | PixelLayout::Rgbaz160 => {
                    for c in 0..3 {
                        write_f32(px, c * 4, tint[c]);
                    }
                    write_f32(px, 12, alpha);
                    if layout == PixelLayout::Rgbaz160 {
                        write_f32(px, 16, depth_plane);
                    }
                }
            }
        }
    }
    (image, depth)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(args.log_file.as_ref());

    let default_path = PathBuf::from("overcast.toml");
    let file = match args.config.as_ref() {
        Some(path) => FileConfig::load(path)?,
        None if default_path.exists() => FileConfig::load(&default_path)?,
        None => FileConfig::default(),
    };

    let nranks = args.ranks.unwrap_or(file.compose.ranks);
    let width = args.width.unwrap_or(file.image.width);
    let height = args.height.unwrap_or(file.image.height);
    let layout = config::parse_layout(args.layout.as_deref().unwrap_or(&file.compose.layout))?;
    let merge = config::parse_merge(args.merge.as_deref().unwrap_or(&file.compose.merge))?;
    let gather = config::parse_gather(args.gather.as_deref().unwrap_or(&file.compose.gather))?;
    if merge == MergeMode::Depth && !layout.has_depth() {
        anyhow::bail!("depth merge needs an rgbaz layout, got {layout}");
    }

    info!(
        target: "runtime.startup",
        nranks,
        width,
        height,
        layout = %layout,
        merge = %merge,
        gather = %gather,
        "compositing demo"
    );

    let started = Instant::now();
    let outputs = LocalGroup::run(nranks, |comm| {
        let rank = comm.rank();
        let (mut image, depth) = render_band(rank, nranks, width, height, layout);
        let mut compositor =
            Compositor::init(Arc::new(comm), width, height, layout, merge, gather)
                .expect("compositor init");
        match merge {
            MergeMode::Alpha => compositor
                .run_sorted(&mut image, &depth)
                .expect("sorted alpha composite"),
            MergeMode::Depth => compositor.run(&mut image).expect("depth composite"),
        }
        (rank == 0).then_some(image)
    });
    let elapsed = started.elapsed();

    let final_image = outputs
        .into_iter()
        .flatten()
        .next()
        .context("root produced no image")?;
    let checksum: u64 = final_image
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(131).wrapping_add(b as u64));

    info!(
        target: "runtime.startup",
        elapsed_ms = elapsed.as_millis() as u64,
        bytes = final_image.len(),
        checksum,
        "composite complete"
    );
    println!(
        "{nranks} ranks, {width}x{height} {layout}/{merge}/{gather}: {} bytes in {:.1?} (checksum {checksum:#018x})",
        final_image.len(),
        elapsed
    );
    Ok(())
}
