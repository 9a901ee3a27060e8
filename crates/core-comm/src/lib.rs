//! Process-group transport seam for the compositor.
//!
//! The compositing engine is a collective algorithm: every rank of a group
//! enters the same operations in the same program order. This crate pins
//! down the narrow transport contract the engine needs (`Communicator`) and
//! ships an in-process implementation (`LocalComm`) where each rank is a
//! thread and every directed rank pair has its own channel. Production
//! deployments put an MPI communicator behind the same trait; the engine
//! never names a backend.
//!
//! Contract notes:
//! * Point-to-point messages are matched by `(sender, tag)` and arrive in
//!   the order they were sent between a given pair. Tags exist to catch
//!   schedule bugs, not to reorder traffic: receiving a message whose tag
//!   or size differs from what the caller posted is a protocol error.
//! * `exchange` pairs one send with one receive the way a non-blocking
//!   send/recv pair with two waits would; neither side may depend on the
//!   other's receive having started.
//! * Collectives (`allgather`, `gather`, `gatherv`, `split`) must be
//!   entered by every rank of the communicator. The default implementations
//!   are point-to-point fan-ins that any buffered backend can inherit.
//! * `split` mirrors the classic color/key communicator split: ranks that
//!   pass `None` take part in the collective but end up in no subgroup.

use std::time::Duration;
use thiserror::Error;

mod local;

pub use local::{LocalComm, LocalGroup};

/// Reserved tag range for the collectives' internal traffic. Schedule code
/// must stay below this range.
pub const TAG_COLLECTIVE_BASE: u32 = 0xffff_ff00;
const TAG_ALLGATHER: u32 = TAG_COLLECTIVE_BASE;
const TAG_GATHER: u32 = TAG_COLLECTIVE_BASE + 1;
const TAG_GATHERV: u32 = TAG_COLLECTIVE_BASE + 2;
const TAG_SPLIT: u32 = TAG_COLLECTIVE_BASE + 3;

/// Transport failures. Any of these aborts the collective in progress;
/// recovery is re-initialization, never a retry.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {peer} is gone (channel closed)")]
    Disconnected { peer: usize },

    #[error("timed out after {timeout:?} waiting for rank {peer} (tag {tag:#x})")]
    Timeout {
        peer: usize,
        tag: u32,
        timeout: Duration,
    },

    #[error(
        "protocol mismatch from rank {peer}: expected tag {expected_tag:#x} ({expected_len} B), \
         got tag {got_tag:#x} ({got_len} B)"
    )]
    Protocol {
        peer: usize,
        expected_tag: u32,
        expected_len: usize,
        got_tag: u32,
        got_len: usize,
    },

    #[error("invalid peer {peer} for a group of {size}")]
    InvalidPeer { peer: usize, size: usize },
}

pub type CommResult<T> = Result<T, CommError>;

/// Destination-side description of a variable-count gather, supplied by the
/// root only. `counts[r]` bytes from rank `r` land at `displs[r]`.
pub struct GathervDest<'a> {
    pub counts: &'a [usize],
    pub displs: &'a [usize],
    pub buf: &'a mut [u8],
}

/// The collective transport the compositing engine runs on.
pub trait Communicator: Send + Sync {
    /// This process's rank within the communicator, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// Post `data` to `to`. Must not block on the receiver's progress.
    fn send(&self, to: usize, tag: u32, data: &[u8]) -> CommResult<()>;

    /// Receive exactly `buf.len()` bytes from `from` under `tag`.
    fn recv(&self, from: usize, tag: u32, buf: &mut [u8]) -> CommResult<()>;

    /// One paired send/receive with the same peer, both in flight at once.
    fn exchange(
        &self,
        peer: usize,
        send_tag: u32,
        send: &[u8],
        recv_tag: u32,
        recv: &mut [u8],
    ) -> CommResult<()> {
        self.send(peer, send_tag, send)?;
        self.recv(peer, recv_tag, recv)
    }

    /// Every rank contributes `send`; every rank ends with all
    /// contributions concatenated in rank order. `recv` must be
    /// `size() * send.len()` bytes.
    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> CommResult<()> {
        let (me, n) = (self.rank(), self.size());
        let len = send.len();
        debug_assert_eq!(recv.len(), n * len);
        for to in 0..n {
            if to != me {
                self.send(to, TAG_ALLGATHER, send)?;
            }
        }
        recv[me * len..(me + 1) * len].copy_from_slice(send);
        for from in 0..n {
            if from != me {
                self.recv(from, TAG_ALLGATHER, &mut recv[from * len..(from + 1) * len])?;
            }
        }
        Ok(())
    }

    /// Fixed-count gather: all ranks send the same number of bytes, the
    /// root receives them concatenated in rank order. Only the root passes
    /// `Some(recv)` (sized `size() * send.len()`).
    fn gather(&self, root: usize, send: &[u8], recv: Option<&mut [u8]>) -> CommResult<()> {
        let (me, n) = (self.rank(), self.size());
        if me != root {
            return self.send(root, TAG_GATHER, send);
        }
        let recv = recv.expect("gather root must supply a destination buffer");
        let len = send.len();
        debug_assert_eq!(recv.len(), n * len);
        for from in 0..n {
            let slot = &mut recv[from * len..(from + 1) * len];
            if from == me {
                slot.copy_from_slice(send);
            } else {
                self.recv(from, TAG_GATHER, slot)?;
            }
        }
        Ok(())
    }

    /// Variable-count gather. Every rank sends its own byte count; the root
    /// scatters the contributions at the displacements it supplies.
    fn gatherv(&self, root: usize, send: &[u8], dest: Option<GathervDest<'_>>) -> CommResult<()> {
        let me = self.rank();
        if me != root {
            return self.send(root, TAG_GATHERV, send);
        }
        let dest = dest.expect("gatherv root must supply a destination");
        for from in 0..self.size() {
            let at = dest.displs[from];
            let slot = &mut dest.buf[at..at + dest.counts[from]];
            if from == me {
                slot.copy_from_slice(send);
            } else {
                self.recv(from, TAG_GATHERV, slot)?;
            }
        }
        Ok(())
    }

    /// Partition the communicator by `color`, ordering each subgroup by
    /// `(key, rank)`. Returns the subgroup communicator, or `None` for
    /// ranks that passed `color: None`.
    fn split(&self, color: Option<u32>, key: u32) -> CommResult<Option<Box<dyn Communicator>>>;
}

/// Encode one rank's split vote for the default split negotiation.
pub(crate) fn encode_split_vote(color: Option<u32>, key: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&u32::from(color.is_some()).to_le_bytes());
    out[4..8].copy_from_slice(&color.unwrap_or(0).to_le_bytes());
    out[8..12].copy_from_slice(&key.to_le_bytes());
    out
}

pub(crate) fn decode_split_vote(bytes: &[u8]) -> (Option<u32>, u32) {
    let flag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let color = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let key = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    ((flag != 0).then_some(color), key)
}
