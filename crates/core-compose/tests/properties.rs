//! Schedule-independence properties, exercised across every distinct
//! exchange shape: N = 2 and 4 (binary-swap), N = 3 (direct-send), N = 5,
//! 6, 7, 9, 12 (2-3-4 decomposition), with odd pixel counts and both
//! gather modes.

mod common;

use common::{Setup, composite, composite_depth, composite_sorted, pattern, reference};
use core_compose::{
    Communicator, Compositor, GatherMode, LocalGroup, MergeMode, PixelLayout,
};
use core_pixel::write_f32;
use std::sync::Arc;

const RANK_COUNTS: [usize; 8] = [2, 3, 4, 5, 6, 7, 9, 12];
const BOTH_GATHERS: [GatherMode; 2] = [GatherMode::Gather, GatherMode::Gatherv];

/// Per-pixel provenance images: for pixel `i`, ranks in front of its owner
/// `i % n` are fully transparent and the owner is opaque, so the composite
/// must reproduce the owner's bytes exactly at every pixel.
fn provenance_images(n: usize, npixels: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|rank| {
            let mut img = vec![0u8; npixels * 4];
            for i in 0..npixels {
                let owner = i % n;
                if rank >= owner {
                    let v = pattern(rank * npixels + i, 3);
                    img[4 * i..4 * i + 3].copy_from_slice(&v);
                    img[4 * i + 3] = 255;
                }
            }
            img
        })
        .collect()
}

#[test]
fn pixel_conservation_across_every_schedule() {
    // 63 pixels: odd, indivisible by most rank counts, exercises the
    // Gatherv odd splits and the Gather padding trick alike.
    let (w, h) = (9, 7);
    for n in RANK_COUNTS {
        let images = provenance_images(n, (w * h) as usize);
        let expect = reference(Setup::rgba32(w, h, GatherMode::Gatherv), &images);
        for gather in BOTH_GATHERS {
            let got = composite(Setup::rgba32(w, h, gather), &images);
            assert_eq!(got, expect, "n={n} gather={gather}");
        }
    }
}

#[test]
fn pixel_conservation_float_pipeline() {
    let (w, h) = (5, 5);
    let npixels = (w * h) as usize;
    for n in [2usize, 3, 5, 8] {
        let images: Vec<Vec<u8>> = (0..n)
            .map(|rank| {
                let mut img = vec![0u8; npixels * 16];
                for i in 0..npixels {
                    let owner = i % n;
                    if rank >= owner {
                        let px = &mut img[16 * i..16 * i + 16];
                        for c in 0..3 {
                            write_f32(px, c * 4, ((rank * 7 + i * 3 + c) % 11) as f32 / 11.0);
                        }
                        write_f32(px, 12, 1.0);
                    }
                }
                img
            })
            .collect();
        let setup = Setup {
            width: w,
            height: h,
            layout: PixelLayout::Rgba128,
            merge: MergeMode::Alpha,
            gather: GatherMode::Gatherv,
        };
        let expect = reference(setup, &images);
        for gather in BOTH_GATHERS {
            let got = composite(Setup { gather, ..setup }, &images);
            assert_eq!(got, expect, "n={n} gather={gather}");
        }
    }
}

fn rgbaz64_inputs(n: usize, npixels: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|rank| {
            let mut img = vec![0u8; npixels * 8];
            for i in 0..npixels {
                let px = &mut img[8 * i..8 * i + 8];
                let color = pattern(rank * 1000 + i, 4);
                px[..4].copy_from_slice(&color);
                // Distinct depths per (rank, pixel): permutation must not
                // matter when no two ranks tie.
                let z = ((rank * 37 + i * 11) % (n * npixels)) as f32 * 0.25 + 0.5;
                write_f32(px, 4, z);
            }
            img
        })
        .collect()
}

#[test]
fn depth_test_is_permutation_invariant() {
    let (w, h) = (7, 3);
    let npixels = (w * h) as usize;
    for n in [2usize, 3, 4, 5, 7] {
        let setup = Setup {
            width: w,
            height: h,
            layout: PixelLayout::Rgbaz64,
            merge: MergeMode::Depth,
            gather: GatherMode::Gatherv,
        };
        let images = rgbaz64_inputs(n, npixels);
        let expect = reference(setup, &images);

        // Rotate and reverse the rank assignment; the winner per pixel is
        // decided by Z alone, so root must see identical bytes.
        let mut rotated = images.clone();
        rotated.rotate_left(n / 2 + 1);
        let mut reversed = images.clone();
        reversed.reverse();

        for arrangement in [&images, &rotated, &reversed] {
            for gather in BOTH_GATHERS {
                let got = composite(Setup { gather, ..setup }, arrangement);
                assert_eq!(got, expect, "n={n} gather={gather}");
            }
        }
    }
}

#[test]
fn alpha_order_matters_without_the_pre_sort() {
    let setup = Setup::rgba32(4, 2, GatherMode::Gatherv);
    let red = [255u8, 0, 0, 255].repeat(8);
    let blue = [0u8, 0, 255, 255].repeat(8);
    let front_red = composite(setup, &[red.clone(), blue.clone()]);
    let front_blue = composite(setup, &[blue, red]);
    assert_ne!(front_red, front_blue);
}

#[test]
fn pre_sort_makes_initial_order_irrelevant() {
    let (w, h) = (6, 4);
    let npixels = (w * h) as usize;
    let n = 4;

    // One flat depth per rank; distinct everywhere, so the sorted order is
    // total and the composite is unique.
    let layers: Vec<(Vec<u8>, Vec<f32>)> = (0..n)
        .map(|k| {
            let mut img = vec![0u8; npixels * 4];
            for i in 0..npixels {
                img[4 * i..4 * i + 4].copy_from_slice(&[
                    (k as u8 + 1) * 40,
                    pattern(k * 100 + i, 1)[0],
                    0,
                    128,
                ]);
            }
            let depth = vec![(k as f32) * 2.0 + 1.0; npixels];
            (img, depth)
        })
        .collect();

    let mut outputs = Vec::new();
    for shuffle in [[0usize, 1, 2, 3], [3, 1, 0, 2], [2, 3, 1, 0]] {
        let images: Vec<Vec<u8>> = shuffle.iter().map(|&k| layers[k].0.clone()).collect();
        let depths: Vec<Vec<f32>> = shuffle.iter().map(|&k| layers[k].1.clone()).collect();
        for gather in BOTH_GATHERS {
            outputs.push(composite_sorted(
                Setup::rgba32(w, h, gather),
                &images,
                &depths,
            ));
        }
    }
    for out in &outputs[1..] {
        assert_eq!(out, &outputs[0]);
    }

    // The scalar entry point behaves exactly like a flat depth buffer.
    let scalar = LocalGroup::run(n, |comm| {
        let rank = comm.rank();
        let mut image = layers[rank].0.clone();
        let min_depth = layers[rank].1[0];
        let mut compositor = Compositor::init(
            Arc::new(comm),
            w,
            h,
            PixelLayout::Rgba32,
            MergeMode::Alpha,
            GatherMode::Gatherv,
        )
        .expect("init");
        compositor
            .run_sorted_value(&mut image, min_depth)
            .expect("run_sorted_value");
        (rank == 0).then_some(image)
    });
    let scalar_out = scalar.into_iter().flatten().next().unwrap();
    assert_eq!(scalar_out, outputs[1], "identity shuffle, gatherv output");
}

#[test]
fn reinit_and_rerun_reproduces_the_output() {
    let (w, h) = (5, 5);
    let n = 5;
    let images = provenance_images(n, (w * h) as usize);

    let run_twice = LocalGroup::run(n, |comm| {
        let comm: Arc<dyn Communicator> = Arc::new(comm);
        let setup = Setup::rgba32(w, h, GatherMode::Gatherv);
        let mut first = images[comm.rank()].clone();
        let mut compositor = Compositor::init(
            Arc::clone(&comm),
            setup.width,
            setup.height,
            setup.layout,
            setup.merge,
            setup.gather,
        )
        .expect("first init");
        compositor.run(&mut first).expect("first run");
        compositor.destroy();

        // Rebuild with identical geometry.
        let mut second = images[comm.rank()].clone();
        let mut rebuilt = Compositor::init(
            Arc::clone(&comm),
            setup.width,
            setup.height,
            setup.layout,
            setup.merge,
            setup.gather,
        )
        .expect("second init");
        rebuilt.run(&mut second).expect("second run");
        (comm.rank() == 0).then_some((first, second))
    });
    let (first, second) = run_twice.into_iter().flatten().next().unwrap();
    assert_eq!(first, second);
}

#[test]
fn run_borrowed_sees_the_same_result_as_run() {
    let (w, h) = (4, 4);
    let n = 4;
    let images = provenance_images(n, (w * h) as usize);

    for gather in BOTH_GATHERS {
        let expect = composite(Setup::rgba32(w, h, gather), &images);
        let borrowed = LocalGroup::run(n, |comm| {
            let rank = comm.rank();
            let mut image = images[rank].clone();
            let mut compositor = Compositor::init(
                Arc::new(comm),
                w,
                h,
                PixelLayout::Rgba32,
                MergeMode::Alpha,
                gather,
            )
            .expect("init");
            compositor
                .run_borrowed(&mut image)
                .expect("run_borrowed")
                .map(<[u8]>::to_vec)
        });
        let root_view = borrowed[0].clone().expect("root gets a view");
        assert_eq!(root_view, expect, "{gather}");
        assert!(borrowed[1..].iter().all(|v| v.is_none()));
    }
}

#[test]
fn depth_mode_from_split_buffers_matches_packed_input() {
    let (w, h) = (4, 3);
    let npixels = (w * h) as usize;
    let n = 3;

    let packed = rgbaz64_inputs(n, npixels);
    let setup_packed = Setup {
        width: w,
        height: h,
        layout: PixelLayout::Rgbaz64,
        merge: MergeMode::Depth,
        gather: GatherMode::Gatherv,
    };
    let expect = composite(setup_packed, &packed);

    // The same inputs as separate color + depth buffers through run_depth.
    let colors: Vec<Vec<u8>> = packed
        .iter()
        .map(|img| {
            img.chunks_exact(8)
                .flat_map(|px| px[..4].to_vec())
                .collect()
        })
        .collect();
    let depths: Vec<Vec<f32>> = packed
        .iter()
        .map(|img| {
            img.chunks_exact(8)
                .map(|px| f32::from_ne_bytes(px[4..8].try_into().unwrap()))
                .collect()
        })
        .collect();

    let (color, depth) = composite_depth(setup_packed, &colors, &depths);
    let expect_color: Vec<u8> = expect
        .chunks_exact(8)
        .flat_map(|px| px[..4].to_vec())
        .collect();
    let expect_depth: Vec<f32> = expect
        .chunks_exact(8)
        .map(|px| f32::from_ne_bytes(px[4..8].try_into().unwrap()))
        .collect();
    assert_eq!(color, expect_color);
    assert_eq!(depth, expect_depth);
}
