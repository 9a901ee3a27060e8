//! The public compositor value: init, run, destroy.
//!
//! A `Compositor` owns everything one rank needs across composites: the
//! merge kernel pair picked for the layout/mode, the precomputed exchange
//! plan, the scratch buffer, the derived gather communicator and, in
//! `Gather` mode, the padded working copies. Construction is `init`,
//! dropping the value is `destroy`; a transport failure mid-collective
//! poisons the instance and every later `run` reports `WrongState` until
//! the host rebuilds it.

use std::sync::Arc;

use core_comm::{Communicator, GathervDest};
use core_merge::{MergeKernel, MergeMode};
use core_pixel::{PixelLayout, pack_depth, unpack_depth};
use core_plan::{ExchangePlan, GatherMode, GatherRole, tag};

use crate::buffer::ScratchBuffer;
use crate::error::{CompositeError, Result, try_zeroed};
use crate::exchange::{depth_presort, expect_len, run_plan};

/// The rank that receives the final image.
pub const ROOT: usize = 0;

pub struct Compositor {
    comm: Arc<dyn Communicator>,
    gather_comm: Option<Box<dyn Communicator>>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    merge_mode: MergeMode,
    gather_mode: GatherMode,
    kernel: MergeKernel,
    plan: ExchangePlan,
    scratch: ScratchBuffer,
    /// Padded working image; empty unless the padded `Gather` path runs.
    work: Vec<u8>,
    /// Root-only destination for the fixed-size gather; empty elsewhere.
    root_dest: Vec<u8>,
    poisoned: bool,
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("rank", &self.comm.rank())
            .field("nranks", &self.comm.size())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("merge_mode", &self.merge_mode)
            .field("gather_mode", &self.gather_mode)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl Compositor {
    /// Build a ready compositor. Collective: every rank of `comm` must call
    /// with identical geometry, layout and modes. On error nothing stays
    /// allocated and no communicator is derived.
    pub fn init(
        comm: Arc<dyn Communicator>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        merge_mode: MergeMode,
        gather_mode: GatherMode,
    ) -> Result<Self> {
        let npixels = width as usize * height as usize;
        if npixels == 0 {
            return Err(CompositeError::InvalidArgument(
                "image geometry must be non-empty".into(),
            ));
        }
        let nranks = comm.size();
        if npixels < nranks {
            return Err(CompositeError::InvalidArgument(format!(
                "{npixels} pixels cannot be split across {nranks} ranks"
            )));
        }
        let kernel = MergeKernel::select(layout, merge_mode).ok_or_else(|| {
            CompositeError::InvalidArgument(format!(
                "merge mode {merge_mode} is not defined for layout {layout}"
            ))
        })?;

        let plan = core_plan::build(comm.rank(), nranks, npixels, gather_mode);
        let bpp = layout.bytes_per_pixel();

        let floor = match gather_mode {
            GatherMode::Gatherv => npixels / 2 + 1,
            GatherMode::Gather => plan.padded_pixels() / 2,
        };
        let scratch = ScratchBuffer::allocate(plan.scratch_pixels.max(floor), bpp)?;

        let gather_comm = match plan.gather {
            GatherRole::Collective {
                participating,
                exchange_key,
                bitrev_key,
            } => {
                let key = match gather_mode {
                    GatherMode::Gatherv => exchange_key,
                    GatherMode::Gather => bitrev_key,
                };
                comm.split(participating.then_some(0), key)?
            }
            _ => None,
        };

        let padded_gather =
            gather_mode == GatherMode::Gather && matches!(plan.gather, GatherRole::Collective { .. });
        let padded_bytes = plan.padded_pixels() * bpp;
        let work = if padded_gather {
            try_zeroed(padded_bytes)?
        } else {
            Vec::new()
        };
        let root_dest = if padded_gather && comm.rank() == ROOT {
            try_zeroed(padded_bytes)?
        } else {
            Vec::new()
        };

        tracing::info!(
            target: "compose.init",
            rank = comm.rank(),
            nranks,
            width,
            height,
            layout = %layout,
            merge = %merge_mode,
            gather = %gather_mode,
            padding = plan.padding,
            scratch_bytes = scratch.capacity(),
            "compositor ready"
        );

        Ok(Self {
            comm,
            gather_comm,
            width,
            height,
            layout,
            merge_mode,
            gather_mode,
            kernel,
            plan,
            scratch,
            work,
            root_dest,
            poisoned: false,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.merge_mode
    }

    pub fn gather_mode(&self) -> GatherMode {
        self.gather_mode
    }

    pub fn npixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == ROOT
    }

    /// Composite `image` (this rank's partial render, in the configured
    /// layout). In alpha mode the caller has already ordered the ranks
    /// front to back; in depth mode no ordering is needed. On return the
    /// root's `image` holds the final picture; other ranks' buffers are
    /// left unspecified.
    pub fn run(&mut self, image: &mut [u8]) -> Result<()> {
        self.ensure_ready()?;
        self.check_image(image.len())?;
        let outcome = self.composite(image);
        self.absorb(outcome)?;
        if self.is_root() && !self.root_dest.is_empty() {
            let real = self.npixels() * self.layout.bytes_per_pixel();
            image.copy_from_slice(&self.root_dest[..real]);
        }
        Ok(())
    }

    /// As [`run`](Self::run), but returns the root's view of the result
    /// without copying it back into `image` when a staging buffer was
    /// used. `None` on non-root ranks.
    pub fn run_borrowed<'a>(&'a mut self, image: &'a mut [u8]) -> Result<Option<&'a [u8]>> {
        self.ensure_ready()?;
        self.check_image(image.len())?;
        let outcome = self.composite(image);
        self.absorb(outcome)?;
        if !self.is_root() {
            return Ok(None);
        }
        let real = self.npixels() * self.layout.bytes_per_pixel();
        Ok(Some(if self.root_dest.is_empty() {
            &image[..real]
        } else {
            &self.root_dest[..real]
        }))
    }

    /// Alpha composite with the global depth sort: ranks are reordered by
    /// ascending minimum depth before the exchange, so the caller needs no
    /// ordering of its own. `depth` is one `f32` per pixel, smaller is
    /// closer.
    pub fn run_sorted(&mut self, image: &mut [u8], depth: &[f32]) -> Result<()> {
        self.ensure_ready()?;
        expect_len("depth buffer", depth.len(), self.npixels())?;
        let min_depth = depth.iter().copied().fold(f32::INFINITY, f32::min);
        self.run_sorted_value(image, min_depth)
    }

    /// As [`run_sorted`](Self::run_sorted) for callers that already know
    /// their partial render's minimum depth and have no per-pixel buffer.
    pub fn run_sorted_value(&mut self, image: &mut [u8], min_depth: f32) -> Result<()> {
        self.ensure_ready()?;
        if self.merge_mode != MergeMode::Alpha {
            return Err(CompositeError::InvalidArgument(
                "the depth pre-sort applies to alpha mode only".into(),
            ));
        }
        self.check_image(image.len())?;

        let outcome = depth_presort(self.comm.as_ref(), image, min_depth);
        self.absorb(outcome)?;

        let outcome = self.composite(image);
        self.absorb(outcome)?;
        if self.is_root() && !self.root_dest.is_empty() {
            let real = self.npixels() * self.layout.bytes_per_pixel();
            image.copy_from_slice(&self.root_dest[..real]);
        }
        Ok(())
    }

    /// Depth-test composite from separate color and depth buffers. The
    /// pair is interleaved into this compositor's RGBAZ layout, exchanged,
    /// and unpacked again on root, winning Z values included.
    pub fn run_depth(&mut self, color: &mut [u8], depth: &mut [f32]) -> Result<()> {
        self.ensure_ready()?;
        if self.merge_mode != MergeMode::Depth {
            return Err(CompositeError::InvalidArgument(
                "run_depth requires depth merge mode".into(),
            ));
        }
        let color_layout = self
            .layout
            .color_part()
            .expect("depth merge mode implies a depth-carrying layout");
        let npixels = self.npixels();
        expect_len(
            "color buffer",
            color.len(),
            npixels * color_layout.bytes_per_pixel(),
        )?;
        expect_len("depth buffer", depth.len(), npixels)?;

        let bpp = self.layout.bytes_per_pixel();
        let mut packed = try_zeroed(npixels * bpp)?;
        pack_depth(self.layout, color, depth, &mut packed);

        let outcome = self.composite(&mut packed);
        self.absorb(outcome)?;

        if self.is_root() {
            let view: &[u8] = if self.root_dest.is_empty() {
                &packed
            } else {
                &self.root_dest[..npixels * bpp]
            };
            unpack_depth(self.layout, view, color, depth);
        }
        Ok(())
    }

    /// Explicit teardown; equivalent to dropping the value.
    pub fn destroy(self) {
        tracing::debug!(
            target: "compose.init",
            rank = self.comm.rank(),
            "compositor destroyed"
        );
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.poisoned {
            return Err(CompositeError::WrongState(
                "a previous collective aborted; destroy and re-init",
            ));
        }
        Ok(())
    }

    fn check_image(&self, len: usize) -> Result<()> {
        expect_len(
            "color buffer",
            len,
            self.npixels() * self.layout.bytes_per_pixel(),
        )
    }

    /// Mark the instance unusable after a transport failure.
    fn absorb<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(CompositeError::Transport(e)) = &outcome {
            tracing::warn!(
                target: "compose.exchange",
                rank = self.comm.rank(),
                error = %e,
                "collective aborted, poisoning compositor"
            );
            self.poisoned = true;
        }
        outcome
    }

    /// Exchange plus gather. On return the result sits in `image`
    /// (`Gatherv`, direct-send and single-rank paths) or in `root_dest`
    /// (padded `Gather` path) on root.
    fn composite(&mut self, image: &mut [u8]) -> Result<()> {
        let bpp = self.layout.bytes_per_pixel();
        let Self {
            comm,
            gather_comm,
            kernel,
            plan,
            scratch,
            work,
            root_dest,
            gather_mode,
            ..
        } = self;

        let buf: &mut [u8] = if work.is_empty() {
            image
        } else {
            let real = plan.npixels * bpp;
            work[..real].copy_from_slice(image);
            work[real..].fill(0);
            work.as_mut_slice()
        };

        run_plan(comm.as_ref(), plan, kernel, bpp, buf, scratch.bytes_mut())?;

        match &plan.gather {
            GatherRole::Single => {}
            GatherRole::Direct3 { tiles } => {
                if comm.rank() == ROOT {
                    for (from, tile) in tiles.iter().enumerate().skip(1) {
                        let at = tile.offset * bpp;
                        comm.recv(from, tag::DIRECT_GATHER, &mut buf[at..at + tile.count * bpp])?;
                    }
                } else {
                    let tile = &tiles[comm.rank()];
                    let at = tile.offset * bpp;
                    comm.send(ROOT, tag::DIRECT_GATHER, &buf[at..at + tile.count * bpp])?;
                }
            }
            GatherRole::Collective { .. } => {
                let Some(g) = gather_comm.as_deref() else {
                    // Non-participants hold no pixels after the exchange.
                    return Ok(());
                };
                let window_bytes = plan.window.count * bpp;
                let window_at = plan.window.offset * bpp;
                match gather_mode {
                    GatherMode::Gather => {
                        let send = &buf[window_at..window_at + window_bytes];
                        if g.rank() == ROOT {
                            g.gather(ROOT, send, Some(root_dest.as_mut_slice()))?;
                        } else {
                            g.gather(ROOT, send, None)?;
                        }
                    }
                    GatherMode::Gatherv => {
                        let mut pair = [0u8; 16];
                        pair[..8].copy_from_slice(&(window_bytes as u64).to_le_bytes());
                        pair[8..].copy_from_slice(&(window_at as u64).to_le_bytes());

                        if g.rank() == ROOT {
                            let gn = g.size();
                            let mut table = vec![0u8; 16 * gn];
                            g.gather(ROOT, &pair, Some(&mut table))?;
                            let mut counts = Vec::with_capacity(gn);
                            let mut displs = Vec::with_capacity(gn);
                            for row in table.chunks_exact(16) {
                                counts.push(u64::from_le_bytes(row[..8].try_into().unwrap()) as usize);
                                displs.push(u64::from_le_bytes(row[8..].try_into().unwrap()) as usize);
                            }
                            // The root's own window goes through scratch so
                            // the destination borrow stays whole.
                            scratch.bytes_mut()[..window_bytes]
                                .copy_from_slice(&buf[window_at..window_at + window_bytes]);
                            tracing::debug!(
                                target: "compose.gather",
                                participants = gn,
                                total_bytes = counts.iter().sum::<usize>(),
                                "variable gather"
                            );
                            g.gatherv(
                                ROOT,
                                &scratch.bytes_mut()[..window_bytes],
                                Some(GathervDest {
                                    counts: &counts,
                                    displs: &displs,
                                    buf,
                                }),
                            )?;
                        } else {
                            g.gather(ROOT, &pair, None)?;
                            g.gatherv(ROOT, &buf[window_at..window_at + window_bytes], None)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
