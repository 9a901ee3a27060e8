//! Scratch buffer sizing.
//!
//! The scratch buffer holds one received pixel block at a time, so its
//! floor is the largest receive in the plan (roughly half the padded image
//! plus one pixel for the odd `Gatherv` splits). To keep repeated `run`
//! calls from ever reallocating, the pixel capacity is rounded up to a
//! power-of-two-megapixel bucket, the ladder topping out at 128 Mpixels;
//! anything larger is taken exactly.

use crate::error::{Result, try_zeroed};

const MPIXEL: usize = 1 << 20;
/// Largest bucket on the ladder; beyond this the requirement wins as-is.
const BUCKET_CAP: usize = 128 * MPIXEL;

/// Round a pixel requirement up to its bucket.
pub(crate) fn bucket_pixels(required: usize) -> usize {
    if required > BUCKET_CAP {
        return required;
    }
    let mut bucket = MPIXEL;
    while bucket < required {
        bucket *= 2;
    }
    bucket
}

/// The per-rank receive staging area, zero-filled, bucket-sized.
#[derive(Debug)]
pub(crate) struct ScratchBuffer {
    data: Vec<u8>,
}

impl ScratchBuffer {
    pub(crate) fn allocate(required_pixels: usize, bytes_per_pixel: usize) -> Result<Self> {
        let bytes = bucket_pixels(required_pixels) * bytes_per_pixel;
        Ok(Self {
            data: try_zeroed(bytes)?,
        })
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }
}
