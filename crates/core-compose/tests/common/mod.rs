#![allow(dead_code)] // Shared across the integration tests; each binary uses a subset.

//! Shared harness for the multi-rank integration tests: stands up an
//! in-process group, runs one composite per rank on scoped threads, and
//! returns what root saw.

use core_compose::{
    Communicator, Compositor, GatherMode, LocalGroup, MergeKernel, MergeMode, PixelLayout,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct Setup {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub merge: MergeMode,
    pub gather: GatherMode,
}

impl Setup {
    pub fn rgba32(width: u32, height: u32, gather: GatherMode) -> Self {
        Setup {
            width,
            height,
            layout: PixelLayout::Rgba32,
            merge: MergeMode::Alpha,
            gather,
        }
    }

    pub fn npixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn image_bytes(&self) -> usize {
        self.npixels() * self.layout.bytes_per_pixel()
    }
}

/// Plain composite (`run`); returns the root's output image.
pub fn composite(setup: Setup, images: &[Vec<u8>]) -> Vec<u8> {
    let n = images.len();
    let results = LocalGroup::run(n, |comm| {
        let rank = comm.rank();
        let mut image = images[rank].clone();
        let mut compositor = Compositor::init(
            Arc::new(comm),
            setup.width,
            setup.height,
            setup.layout,
            setup.merge,
            setup.gather,
        )
        .expect("init");
        compositor.run(&mut image).expect("run");
        (rank == 0).then_some(image)
    });
    results.into_iter().flatten().next().expect("root output")
}

/// Depth-sorted alpha composite (`run_sorted`).
pub fn composite_sorted(setup: Setup, images: &[Vec<u8>], depths: &[Vec<f32>]) -> Vec<u8> {
    let n = images.len();
    let results = LocalGroup::run(n, |comm| {
        let rank = comm.rank();
        let mut image = images[rank].clone();
        let mut compositor = Compositor::init(
            Arc::new(comm),
            setup.width,
            setup.height,
            setup.layout,
            setup.merge,
            setup.gather,
        )
        .expect("init");
        compositor
            .run_sorted(&mut image, &depths[rank])
            .expect("run_sorted");
        (rank == 0).then_some(image)
    });
    results.into_iter().flatten().next().expect("root output")
}

/// Depth-test composite from split color/depth buffers (`run_depth`);
/// returns the root's color and depth buffers after write-back.
pub fn composite_depth(
    setup: Setup,
    colors: &[Vec<u8>],
    depths: &[Vec<f32>],
) -> (Vec<u8>, Vec<f32>) {
    let n = colors.len();
    let results = LocalGroup::run(n, |comm| {
        let rank = comm.rank();
        let mut color = colors[rank].clone();
        let mut depth = depths[rank].clone();
        let mut compositor = Compositor::init(
            Arc::new(comm),
            setup.width,
            setup.height,
            setup.layout,
            setup.merge,
            setup.gather,
        )
        .expect("init");
        compositor.run_depth(&mut color, &mut depth).expect("run_depth");
        (rank == 0).then_some((color, depth))
    });
    results.into_iter().flatten().next().expect("root output")
}

/// Sequential back-to-front reference: `images[0]` over `images[1]` over
/// the rest, folded right-associatively with the production kernels.
pub fn reference(setup: Setup, images: &[Vec<u8>]) -> Vec<u8> {
    let kernel = MergeKernel::select(setup.layout, setup.merge).expect("kernel");
    let mut acc = images.last().expect("at least one image").clone();
    for over in images[..images.len() - 1].iter().rev() {
        // acc is the under side; fold the nearer image on top of it.
        (kernel.local_under)(&mut acc, over);
    }
    acc
}

/// A deterministic byte pattern, stable across runs.
pub fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed * 131 + 7) % 251) as u8)
        .collect()
}
