//! Per-pixel merge kernels for the compositing exchange.
//!
//! A kernel combines the pixels a rank kept (`local`) with the pixels it just
//! received from its pair (`remote`) and writes the result back over `local`.
//! Which operand plays the Porter-Duff `over` role depends on which side of
//! the pair this rank is, so every layout/mode combination exists in two
//! in-place flavors:
//!
//! * `local_over`: `local` is nearer the viewer, result into `local`.
//! * `local_under`: `remote` is nearer the viewer, result into `local`.
//!
//! The per-layout blend arithmetic is written exactly once and the flavor
//! wrappers only swap the argument order, so the two flavors cannot drift.
//! Kernels are data-parallel over pixels with `rayon`; the partition
//! granularity is never smaller than one whole pixel and each pixel reads
//! both operands fully before writing, so the in-place update is safe.
//!
//! Numerical contract (alpha mode, premultiplied inputs):
//! * byte layouts keep all alpha math in `f32`, round to nearest on the
//!   final cast and saturate/clamp to 0..=255;
//! * float layouts clamp each channel to 0.0..=1.0 after the blend;
//! * depth under alpha mode is not read and the output Z equals the `over`
//!   pixel's Z.
//!
//! Depth mode copies the whole winning pixel verbatim; ties go to `over`.

use core_pixel::PixelLayout;
use rayon::prelude::*;

mod alpha;
mod depth;

pub use alpha::*;
pub use depth::*;

/// Which reduction `run` applies at every pairwise merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Back-to-front Porter-Duff `over` on premultiplied color. Correctness
    /// depends on the rank ordering established before the exchange.
    Alpha,
    /// Keep the pixel with the smaller Z. Commutative, needs no pre-sort,
    /// legal only for depth-carrying layouts.
    Depth,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MergeMode::Alpha => "alpha",
            MergeMode::Depth => "depth",
        })
    }
}

/// One in-place merge entry point: result lands in the first argument.
pub type MergeFn = fn(local: &mut [u8], remote: &[u8]);

/// The pair of in-place flavors selected once at init; the exchange loop
/// calls through these without ever switching on the layout again.
#[derive(Clone, Copy)]
pub struct MergeKernel {
    pub local_over: MergeFn,
    pub local_under: MergeFn,
}

impl std::fmt::Debug for MergeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeKernel").finish_non_exhaustive()
    }
}

impl MergeKernel {
    /// Resolve the kernel pair for a layout/mode combination. `None` when
    /// the combination is unsupported (`Depth` with a layout that has no Z).
    pub fn select(layout: PixelLayout, mode: MergeMode) -> Option<MergeKernel> {
        let kernel = match (mode, layout) {
            (MergeMode::Alpha, PixelLayout::Rgba32) => MergeKernel {
                local_over: alpha_rgba32_local_over,
                local_under: alpha_rgba32_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgba56) => MergeKernel {
                local_over: alpha_rgba56_local_over,
                local_under: alpha_rgba56_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgba64) => MergeKernel {
                local_over: alpha_rgba64_local_over,
                local_under: alpha_rgba64_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgbaz64) => MergeKernel {
                local_over: alpha_rgbaz64_local_over,
                local_under: alpha_rgbaz64_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgbaz88) => MergeKernel {
                local_over: alpha_rgbaz88_local_over,
                local_under: alpha_rgbaz88_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgbaz96) => MergeKernel {
                local_over: alpha_rgbaz96_local_over,
                local_under: alpha_rgbaz96_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgba128) => MergeKernel {
                local_over: alpha_rgba128_local_over,
                local_under: alpha_rgba128_local_under,
            },
            (MergeMode::Alpha, PixelLayout::Rgbaz160) => MergeKernel {
                local_over: alpha_rgbaz160_local_over,
                local_under: alpha_rgbaz160_local_under,
            },
            (MergeMode::Depth, PixelLayout::Rgbaz64) => MergeKernel {
                local_over: depth_rgbaz64_local_over,
                local_under: depth_rgbaz64_local_under,
            },
            (MergeMode::Depth, PixelLayout::Rgbaz88) => MergeKernel {
                local_over: depth_rgbaz88_local_over,
                local_under: depth_rgbaz88_local_under,
            },
            (MergeMode::Depth, PixelLayout::Rgbaz96) => MergeKernel {
                local_over: depth_rgbaz96_local_over,
                local_under: depth_rgbaz96_local_under,
            },
            (MergeMode::Depth, PixelLayout::Rgbaz160) => MergeKernel {
                local_over: depth_rgbaz160_local_over,
                local_under: depth_rgbaz160_local_under,
            },
            (MergeMode::Depth, _) => return None,
        };
        Some(kernel)
    }
}

/// Drive a per-pixel blend over paired chunks of `local` and `remote`.
///
/// `blend(over, under, out)` fills a staging pixel that is then copied
/// back over the `local` chunk, so a blend may freely read its inputs in
/// any order.
#[inline]
pub(crate) fn for_each_pixel<const BPP: usize>(
    local: &mut [u8],
    remote: &[u8],
    blend: impl Fn(&[u8], &[u8], &mut [u8]) + Sync,
    local_is_over: bool,
) {
    debug_assert_eq!(local.len() % BPP, 0);
    debug_assert_eq!(local.len(), remote.len());

    local
        .par_chunks_exact_mut(BPP)
        .zip(remote.par_chunks_exact(BPP))
        .for_each(|(l, r)| {
            let mut out = [0u8; BPP];
            if local_is_over {
                blend(l, r, &mut out);
            } else {
                blend(r, l, &mut out);
            }
            l.copy_from_slice(&out);
        });
}
