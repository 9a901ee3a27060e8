//! Exchange planning: who talks to whom, in what order, about which pixels.
//!
//! Everything data-dependent about the compositing schedule is computed
//! here, once, at init time. The result is an [`ExchangePlan`]: a flat list
//! of send / receive-merge operations in world-rank terms plus the window
//! of the image this rank owns when the list is exhausted. The executor in
//! `core-compose` drives the list with a single loop and never needs to
//! know whether the rank count was a power of two, a 2-3-4 decomposition,
//! or the three-rank special case.
//!
//! Schedules produced:
//! * N = 1: empty plan, the rank already owns the whole image.
//! * N = 3: direct-send over three contiguous tiles, the last tile
//!   absorbing `npixels mod 3`.
//! * power-of-two N: the classic binary-swap, `log2(N)` pairwise stages.
//! * any other N: contiguous groups of 2, 3 or 4 ranks run an intra-group
//!   swap that leaves the group's image halved onto its first two ranks,
//!   then those pairs continue a power-of-two binary-swap across groups.
//!
//! Pixel bookkeeping follows the gather mode. `Gatherv` halves odd windows
//! as `floor(n/2)` kept by the left side and `floor(n/2) + 1` sent, so any
//! pixel count works without padding. `Gather` pads the pixel count to a
//! multiple of the power-of-two group size up front and trims the padding
//! from the first exchange of the power-of-two schedule so only real bytes
//! travel.

use std::ops::Range;

pub mod tag {
    //! Message tags, one per distinct edge kind of the schedule. A strict
    //! transport can verify them and turn a mis-paired send into an error
    //! instead of a corrupted image.

    /// Binary-swap payload from the lower-ranked side of a pair.
    pub const SWAP_FWD: u32 = 0x10;
    /// Binary-swap payload from the higher-ranked side.
    pub const SWAP_REV: u32 = 0x11;
    /// Group choreography: third rank's lower half to the group's first.
    pub const PAIR_02: u32 = 0x12;
    /// Group choreography: third rank's upper half to the group's second.
    pub const PAIR_12: u32 = 0x13;
    /// Group of four: fourth rank's upper half to the group's second.
    pub const PAIR_13: u32 = 0x14;
    /// Direct-send gather legs to root (N = 3 only).
    pub const DIRECT_GATHER: u32 = 0x15;
    /// Full-image rotation during the depth pre-sort.
    pub const PRESORT: u32 = 0x16;
}

/// How the final image is collected on root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherMode {
    /// Fixed-size contributions over a bit-reverse-ordered communicator.
    /// Requires padding the pixel count to a multiple of the group size.
    Gather,
    /// Variable `(offset, count)` contributions; exact, no padding, one
    /// extra small collective for the size table.
    Gatherv,
}

impl std::fmt::Display for GatherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GatherMode::Gather => "gather",
            GatherMode::Gatherv => "gatherv",
        })
    }
}

/// A contiguous run of pixels within the (padded) image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRange {
    pub offset: usize,
    pub count: usize,
}

impl PixelRange {
    pub const fn new(offset: usize, count: usize) -> Self {
        Self { offset, count }
    }

    pub fn as_range(&self) -> Range<usize> {
        self.offset..self.offset + self.count
    }
}

/// One step of this rank's schedule. Peers are world ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOp {
    /// Pairwise swap: send `send`, receive `merge.count` pixels from the
    /// same peer, fold the received block into the kept `merge` window.
    /// `local_is_over` says which operand is nearer the viewer.
    Exchange {
        peer: usize,
        send_tag: u32,
        recv_tag: u32,
        send: PixelRange,
        merge: PixelRange,
        local_is_over: bool,
    },
    /// One-way contribution of `range` to `peer` (group choreographies).
    Send {
        peer: usize,
        tag: u32,
        range: PixelRange,
    },
    /// Receive `merge.count` pixels from `peer` and fold them into the
    /// kept window.
    RecvMerge {
        peer: usize,
        tag: u32,
        merge: PixelRange,
        local_is_over: bool,
    },
}

/// How this rank takes part in the final gather.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatherRole {
    /// Single rank: the caller's buffer already holds the result.
    Single,
    /// N = 3: root receives the two remote tiles point-to-point.
    Direct3 { tiles: [PixelRange; 3] },
    /// Collective gather among the exchange survivors. Non-participants
    /// hold no pixels and sit the gather out.
    Collective {
        participating: bool,
        /// Rank order of the exchange itself; `Gatherv` collects in this
        /// order with explicit offsets.
        exchange_key: u32,
        /// Bit-reversed order; `Gather` collects in this order so the
        /// fixed-size tiles concatenate into natural image order.
        bitrev_key: u32,
    },
}

/// The full precomputed schedule for one rank.
#[derive(Debug, Clone)]
pub struct ExchangePlan {
    pub rank: usize,
    pub nranks: usize,
    /// Real pixels in the image.
    pub npixels: usize,
    /// Zero pixels appended for the `Gather` trick; 0 under `Gatherv`.
    pub padding: usize,
    pub ops: Vec<StageOp>,
    /// The sub-image this rank owns after `ops` (padded pixel space).
    /// Zero-count for ranks that do not survive into the gather.
    pub window: PixelRange,
    pub gather: GatherRole,
    /// Largest single receive in the plan, in pixels: the scratch floor.
    pub scratch_pixels: usize,
}

impl ExchangePlan {
    pub fn padded_pixels(&self) -> usize {
        self.npixels + self.padding
    }
}

/// True when `n` is a power of two. Zero is not.
pub const fn is_pow2(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Largest power of two at most `n` (`n >= 1`).
pub const fn prev_pow2(n: usize) -> usize {
    let mut p = 1;
    while p * 2 <= n {
        p *= 2;
    }
    p
}

/// Reverse the low `log2(n)` bits of `rank`; `n` must be a power of two.
pub fn bit_reverse(rank: usize, n: usize) -> usize {
    debug_assert!(is_pow2(n));
    let bits = n.trailing_zeros();
    if bits == 0 {
        return 0;
    }
    rank.reverse_bits() >> (usize::BITS - bits)
}

/// The 2-3-4 decomposition of a non-power-of-two rank count: `Q` groups of
/// contiguous ranks whose sizes are drawn from {2, 3} below the threshold
/// count and {3, 4} above it, where `Q` is half the largest power of two
/// below `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposition {
    /// Number of groups, `prev_pow2(n) / 2`.
    pub ngroups: usize,
    /// Size of the low groups, `floor(n / ngroups)`.
    pub base: usize,
    /// Number of groups that get one extra rank, `n mod ngroups`.
    pub over: usize,
    /// First rank of the larger groups.
    pub threshold: usize,
}

impl Decomposition {
    /// `None` when `n` is a power of two or too small to decompose.
    pub fn new(n: usize) -> Option<Self> {
        if n < 5 || is_pow2(n) {
            return None;
        }
        let ngroups = prev_pow2(n) / 2;
        let base = n / ngroups;
        let over = n % ngroups;
        let threshold = n - over * (base + 1);
        Some(Self {
            ngroups,
            base,
            over,
            threshold,
        })
    }

    pub fn group_of(&self, rank: usize) -> usize {
        if rank < self.threshold {
            rank / self.base
        } else {
            (self.ngroups - self.over) + (rank - self.threshold) / (self.base + 1)
        }
    }

    /// World ranks belonging to `group`.
    pub fn group_range(&self, group: usize) -> Range<usize> {
        let small = self.ngroups - self.over;
        if group < small {
            let start = group * self.base;
            start..start + self.base
        } else {
            let start = self.threshold + (group - small) * (self.base + 1);
            start..start + self.base + 1
        }
    }

    pub fn group_size(&self, group: usize) -> usize {
        self.group_range(group).len()
    }
}

/// Build this rank's plan. `npixels` must be positive and at least the
/// rank count; the compositor validates before calling.
pub fn build(rank: usize, nranks: usize, npixels: usize, mode: GatherMode) -> ExchangePlan {
    assert!(nranks >= 1 && rank < nranks);
    assert!(npixels >= nranks.max(1));

    let padding = padding_for(nranks, npixels, mode);

    let plan = match nranks {
        1 => ExchangePlan {
            rank,
            nranks,
            npixels,
            padding: 0,
            ops: Vec::new(),
            window: PixelRange::new(0, npixels),
            gather: GatherRole::Single,
            scratch_pixels: 0,
        },
        3 => build_direct3(rank, npixels),
        n if is_pow2(n) => build_pow2(rank, nranks, npixels, padding),
        _ => build_234(rank, nranks, npixels, padding),
    };

    tracing::debug!(
        target: "compose.plan",
        rank,
        nranks,
        npixels,
        padding = plan.padding,
        ops = plan.ops.len(),
        window_offset = plan.window.offset,
        window_count = plan.window.count,
        "plan built"
    );
    plan
}

/// Zero pixels appended so the padded count divides the power-of-two group
/// size. Only the `Gather` mode pads; N = 1 and N = 3 never reach a
/// collective gather and stay unpadded.
fn padding_for(nranks: usize, npixels: usize, mode: GatherMode) -> usize {
    if mode == GatherMode::Gatherv || nranks == 1 || nranks == 3 {
        return 0;
    }
    let p = if is_pow2(nranks) {
        nranks
    } else {
        prev_pow2(nranks)
    };
    (p - npixels % p) % p
}

/// One binary-swap step against `peer`, updating `window` in place.
/// `trim` removes the padded tail from the bytes actually exchanged on the
/// first padded stage; it is zero everywhere else.
fn swap_step(
    ops: &mut Vec<StageOp>,
    window: &mut PixelRange,
    peer: usize,
    is_left: bool,
    trim: usize,
) {
    let (off, cnt) = (window.offset, window.count);
    let half = cnt / 2;
    if is_left {
        // Keep the lower half, send the upper (the larger piece when odd).
        let send = PixelRange::new(off + half, cnt - half - trim);
        let merge = PixelRange::new(off, half);
        ops.push(StageOp::Exchange {
            peer,
            send_tag: tag::SWAP_FWD,
            recv_tag: tag::SWAP_REV,
            send,
            merge,
            local_is_over: true,
        });
        *window = PixelRange::new(off, half);
    } else {
        // Send the lower half, keep the upper.
        let keep = cnt - half;
        let send = PixelRange::new(off, half);
        let merge = PixelRange::new(off + half, keep - trim);
        ops.push(StageOp::Exchange {
            peer,
            send_tag: tag::SWAP_REV,
            recv_tag: tag::SWAP_FWD,
            send,
            merge,
            local_is_over: false,
        });
        *window = PixelRange::new(off + half, keep);
    }
}

fn build_pow2(rank: usize, nranks: usize, npixels: usize, padding: usize) -> ExchangePlan {
    let padded = npixels + padding;
    let mut ops = Vec::new();
    let mut window = PixelRange::new(0, padded);

    let stages = nranks.trailing_zeros();
    for stage in 0..stages {
        let offset = 1usize << stage;
        let is_left = (rank / offset) % 2 == 0;
        let peer = if is_left { rank + offset } else { rank - offset };
        let trim = if stage == 0 { padding } else { 0 };
        swap_step(&mut ops, &mut window, peer, is_left, trim);
    }

    finish_collective(
        rank,
        nranks,
        npixels,
        padding,
        ops,
        window,
        true,
        rank as u32,
        bit_reverse(rank, nranks) as u32,
    )
}

fn build_234(rank: usize, nranks: usize, npixels: usize, padding: usize) -> ExchangePlan {
    let padded = npixels + padding;
    let decomp = Decomposition::new(nranks).expect("build_234 needs a decomposable rank count");
    let group = decomp.group_of(rank);
    let members = decomp.group_range(group);
    let g0 = members.start;
    let local = rank - g0;
    let gsize = members.len();

    let half = padded / 2;
    let upper = padded - half;

    let mut ops = Vec::new();
    // Window after the intra-group stage, for the two surviving locals.
    let mut window = match local {
        0 => PixelRange::new(0, half),
        1 => PixelRange::new(half, upper),
        _ => PixelRange::new(0, 0),
    };

    match gsize {
        2 => {
            let mut w = PixelRange::new(0, padded);
            swap_step(&mut ops, &mut w, g0 + 1 - local, local == 0, 0);
        }
        3 => match local {
            0 => {
                let mut w = PixelRange::new(0, padded);
                swap_step(&mut ops, &mut w, g0 + 1, true, 0);
                ops.push(StageOp::RecvMerge {
                    peer: g0 + 2,
                    tag: tag::PAIR_02,
                    merge: PixelRange::new(0, half),
                    local_is_over: true,
                });
            }
            1 => {
                let mut w = PixelRange::new(0, padded);
                swap_step(&mut ops, &mut w, g0, false, 0);
                ops.push(StageOp::RecvMerge {
                    peer: g0 + 2,
                    tag: tag::PAIR_12,
                    merge: PixelRange::new(half, upper),
                    local_is_over: true,
                });
            }
            _ => {
                ops.push(StageOp::Send {
                    peer: g0,
                    tag: tag::PAIR_02,
                    range: PixelRange::new(0, half),
                });
                ops.push(StageOp::Send {
                    peer: g0 + 1,
                    tag: tag::PAIR_12,
                    range: PixelRange::new(half, upper),
                });
            }
        },
        4 => {
            // Stage 1a: two independent pair swaps, 0<->1 and 2<->3.
            let pair_peer = g0 + (local ^ 1);
            let mut w = PixelRange::new(0, padded);
            swap_step(&mut ops, &mut w, pair_peer, local % 2 == 0, 0);
            // Stage 1b: the second pair folds into the first.
            match local {
                0 => ops.push(StageOp::RecvMerge {
                    peer: g0 + 2,
                    tag: tag::PAIR_02,
                    merge: PixelRange::new(0, half),
                    local_is_over: true,
                }),
                1 => ops.push(StageOp::RecvMerge {
                    peer: g0 + 3,
                    tag: tag::PAIR_13,
                    merge: PixelRange::new(half, upper),
                    local_is_over: true,
                }),
                2 => ops.push(StageOp::Send {
                    peer: g0,
                    tag: tag::PAIR_02,
                    range: PixelRange::new(0, half),
                }),
                _ => ops.push(StageOp::Send {
                    peer: g0 + 1,
                    tag: tag::PAIR_13,
                    range: PixelRange::new(half, upper),
                }),
            }
        }
        other => unreachable!("2-3-4 decomposition produced a group of {other}"),
    }

    let participating = local < 2;
    let stage2_size = decomp.ngroups * 2;
    let (exchange_key, bitrev_key) = if participating {
        let s = group * 2 + local;
        // Stage 2 continues the swap from pair distance 2 upward; the
        // distance-1 stage already happened inside the group.
        let mut stage = 1;
        while (1usize << stage) < stage2_size {
            let offset = 1usize << stage;
            let is_left = (s / offset) % 2 == 0;
            let peer_s = if is_left { s + offset } else { s - offset };
            let peer_group = peer_s / 2;
            let peer_world = decomp.group_range(peer_group).start + peer_s % 2;
            swap_step(&mut ops, &mut window, peer_world, is_left, 0);
            stage += 1;
        }
        (s as u32, bit_reverse(s, stage2_size) as u32)
    } else {
        window = PixelRange::new(0, 0);
        (0, 0)
    };

    finish_collective(
        rank,
        nranks,
        npixels,
        padding,
        ops,
        window,
        participating,
        exchange_key,
        bitrev_key,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_collective(
    rank: usize,
    nranks: usize,
    npixels: usize,
    padding: usize,
    ops: Vec<StageOp>,
    window: PixelRange,
    participating: bool,
    exchange_key: u32,
    bitrev_key: u32,
) -> ExchangePlan {
    let scratch_pixels = max_recv(&ops).max(window.count);
    ExchangePlan {
        rank,
        nranks,
        npixels,
        padding,
        ops,
        window,
        gather: GatherRole::Collective {
            participating,
            exchange_key,
            bitrev_key,
        },
        scratch_pixels,
    }
}

fn build_direct3(rank: usize, npixels: usize) -> ExchangePlan {
    let t = npixels / 3;
    let tiles = [
        PixelRange::new(0, t),
        PixelRange::new(t, t),
        PixelRange::new(2 * t, npixels - 2 * t),
    ];

    // Each rank keeps its own tile and trades the other two away; the
    // merges extend the over-chain outward from the rank's own position so
    // the final order is always 0 over 1 over 2.
    let mut ops = Vec::new();
    let push_exchange = |ops: &mut Vec<StageOp>, me: usize, peer: usize| {
        let (fwd, rev) = if me < peer {
            (tag::SWAP_FWD, tag::SWAP_REV)
        } else {
            (tag::SWAP_REV, tag::SWAP_FWD)
        };
        ops.push(StageOp::Exchange {
            peer,
            send_tag: fwd,
            recv_tag: rev,
            send: tiles[peer],
            merge: tiles[me],
            local_is_over: me < peer,
        });
    };
    match rank {
        0 => {
            push_exchange(&mut ops, 0, 1);
            push_exchange(&mut ops, 0, 2);
        }
        1 => {
            push_exchange(&mut ops, 1, 0);
            push_exchange(&mut ops, 1, 2);
        }
        _ => {
            push_exchange(&mut ops, 2, 1);
            push_exchange(&mut ops, 2, 0);
        }
    }

    let window = tiles[rank];
    let scratch_pixels = max_recv(&ops).max(window.count);
    ExchangePlan {
        rank,
        nranks: 3,
        npixels,
        padding: 0,
        ops,
        window,
        gather: GatherRole::Direct3 { tiles },
        scratch_pixels,
    }
}

fn max_recv(ops: &[StageOp]) -> usize {
    ops.iter()
        .map(|op| match op {
            StageOp::Exchange { merge, .. } | StageOp::RecvMerge { merge, .. } => merge.count,
            StageOp::Send { .. } => 0,
        })
        .max()
        .unwrap_or(0)
}
