//! Plan execution and the depth pre-sort pass.
//!
//! `run_plan` drives a precomputed [`ExchangePlan`] over the transport: one
//! loop, three op shapes, no knowledge of how the rank count factored. All
//! pixel ranges in the plan refer to the rank's own working image; received
//! blocks stage through the scratch buffer and are folded into the kept
//! window in place.

use core_comm::{CommError, Communicator};
use core_merge::MergeKernel;
use core_plan::{ExchangePlan, PixelRange, StageOp, tag};

use crate::error::{CompositeError, Result, try_zeroed};

#[inline]
fn byte_range(r: &PixelRange, bpp: usize) -> std::ops::Range<usize> {
    r.offset * bpp..(r.offset + r.count) * bpp
}

pub(crate) fn run_plan(
    comm: &dyn Communicator,
    plan: &ExchangePlan,
    kernel: &MergeKernel,
    bpp: usize,
    image: &mut [u8],
    scratch: &mut [u8],
) -> std::result::Result<(), CommError> {
    for op in &plan.ops {
        match op {
            StageOp::Exchange {
                peer,
                send_tag,
                recv_tag,
                send,
                merge,
                local_is_over,
            } => {
                tracing::trace!(
                    target: "compose.exchange",
                    rank = plan.rank,
                    peer,
                    send_pixels = send.count,
                    recv_pixels = merge.count,
                    "pair exchange"
                );
                let recv_bytes = &mut scratch[..merge.count * bpp];
                comm.exchange(
                    *peer,
                    *send_tag,
                    &image[byte_range(send, bpp)],
                    *recv_tag,
                    recv_bytes,
                )?;
                merge_into(kernel, image, merge, bpp, recv_bytes, *local_is_over);
            }
            StageOp::Send { peer, tag, range } => {
                tracing::trace!(
                    target: "compose.exchange",
                    rank = plan.rank,
                    peer,
                    pixels = range.count,
                    "contribute"
                );
                comm.send(*peer, *tag, &image[byte_range(range, bpp)])?;
            }
            StageOp::RecvMerge {
                peer,
                tag,
                merge,
                local_is_over,
            } => {
                tracing::trace!(
                    target: "compose.exchange",
                    rank = plan.rank,
                    peer,
                    pixels = merge.count,
                    "fold contribution"
                );
                let recv_bytes = &mut scratch[..merge.count * bpp];
                comm.recv(*peer, *tag, recv_bytes)?;
                merge_into(kernel, image, merge, bpp, recv_bytes, *local_is_over);
            }
        }
    }
    Ok(())
}

#[inline]
fn merge_into(
    kernel: &MergeKernel,
    image: &mut [u8],
    window: &PixelRange,
    bpp: usize,
    remote: &[u8],
    local_is_over: bool,
) {
    let local = &mut image[byte_range(window, bpp)];
    if local_is_over {
        (kernel.local_over)(local, remote);
    } else {
        (kernel.local_under)(local, remote);
    }
}

/// The global back-to-front ordering pass for alpha compositing with depth.
///
/// Every rank contributes its minimum depth (already reduced by the
/// caller), all ranks sort the collected minima (ascending, ties by
/// rank), and every rank whose sorted position differs from its own rank
/// trades full color images with the rank that holds the image for its
/// position. Afterwards traversal in rank order is front to back, which
/// is exactly what the exchange's lower-side-is-over convention expects.
pub(crate) fn depth_presort(
    comm: &dyn Communicator,
    image: &mut [u8],
    min_depth: f32,
) -> Result<()> {
    let n = comm.size();
    let me = comm.rank();

    let mut gathered = vec![0u8; 4 * n];
    comm.allgather(&min_depth.to_le_bytes(), &mut gathered)?;

    let mut order: Vec<(f32, usize)> = gathered
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .zip(0..n)
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    // The rank now entitled to my slot in front-to-back order, and the
    // slot my own image belongs in.
    let send_to = order
        .iter()
        .position(|&(_, r)| r == me)
        .expect("every rank appears in the sorted order");
    let recv_from = order[me].1;

    if send_to == me {
        debug_assert_eq!(recv_from, me);
        return Ok(());
    }

    tracing::debug!(
        target: "compose.exchange",
        rank = me,
        min_depth,
        send_to,
        recv_from,
        "depth pre-sort rotation"
    );

    let mut incoming = try_zeroed(image.len())?;
    comm.send(send_to, tag::PRESORT, image)?;
    comm.recv(recv_from, tag::PRESORT, &mut incoming)?;
    image.copy_from_slice(&incoming);
    Ok(())
}

/// Validation helper shared by the `run` entry points.
pub(crate) fn expect_len(what: &str, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(CompositeError::InvalidArgument(format!(
            "{what} holds {got} elements, geometry requires {want}"
        )));
    }
    Ok(())
}
