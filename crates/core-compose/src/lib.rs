//! Sort-last parallel image compositing.
//!
//! Each of N cooperating ranks renders the same viewport over a disjoint
//! slice of the scene and hands its full-resolution partial image to
//! [`Compositor::run`] (or one of its siblings). The engine merges the N
//! partials with a pairwise exchange schedule that scales sub-linearly in
//! N and collects the finished picture on rank 0.
//!
//! The three entry points mirror the three composite modes:
//! * [`Compositor::run`]: alpha over pre-ordered ranks, or depth test over
//!   pre-packed RGBAZ pixels;
//! * [`Compositor::run_sorted`]: alpha with the global back-to-front sort
//!   derived from per-rank minimum depths;
//! * [`Compositor::run_depth`]: depth test from separate color and depth
//!   buffers, packed and unpacked internally.
//!
//! Alpha is premultiplied throughout; see `core-pixel` for the layout
//! catalogue and `core-comm` for the transport contract the engine runs
//! on. Everything is a collective: all ranks construct the compositor and
//! enter each run together, with identical geometry and modes.

mod buffer;
mod compositor;
mod error;
mod exchange;

pub use compositor::{Compositor, ROOT};
pub use error::{CompositeError, Result, Status};

// The full public vocabulary, re-exported so hosts depend on one crate.
pub use core_comm::{CommError, Communicator, GathervDest, LocalComm, LocalGroup};
pub use core_merge::{MergeKernel, MergeMode};
pub use core_pixel::PixelLayout;
pub use core_plan::GatherMode;
