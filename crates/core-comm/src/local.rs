//! In-process rank group backed by `crossbeam-channel`.
//!
//! `LocalGroup::new(n)` builds one unbounded channel per directed rank pair
//! (the mesh) and hands out one `LocalComm` per rank; each rank runs on its
//! own thread. Unbounded mailboxes mean a send never blocks, which is what
//! makes the trait's default fan-in collectives deadlock-free, and a
//! receive that outlives its peer fails fast with a timeout instead of
//! hanging a test run.
//!
//! Sub-communicators produced by `split` reuse the parent mesh: a subgroup
//! is a rank-translation table plus a fresh context id stamped on every
//! packet. The context id is derived deterministically from the parent's
//! context and split sequence number, so all members of a subgroup agree on
//! it without extra traffic. Packets whose context or tag do not match the
//! posted receive surface as `CommError::Protocol`; with a deterministic
//! collective schedule that always means a schedule bug, never reordering.

use crate::{
    CommError, CommResult, Communicator, TAG_SPLIT, decode_split_vote, encode_split_vote,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How long a receive may wait before the group is declared wedged.
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Packet {
    ctx: u64,
    tag: u32,
    data: Box<[u8]>,
}

struct Mesh {
    n: usize,
    // Directed pair channels, indexed `from * n + to`. Every rank only ever
    // pops from its own column; the senders are shared.
    lanes: Vec<(Sender<Packet>, Receiver<Packet>)>,
}

impl Mesh {
    fn lane(&self, from: usize, to: usize) -> &(Sender<Packet>, Receiver<Packet>) {
        &self.lanes[from * self.n + to]
    }
}

/// Builder for an in-process group of `n` ranks.
pub struct LocalGroup;

impl LocalGroup {
    /// One communicator per rank, sharing a fresh mesh.
    pub fn new(n: usize) -> Vec<LocalComm> {
        Self::with_timeout(n, DEFAULT_RECV_TIMEOUT)
    }

    pub fn with_timeout(n: usize, timeout: Duration) -> Vec<LocalComm> {
        assert!(n > 0, "a rank group needs at least one member");
        let mesh = Arc::new(Mesh {
            n,
            lanes: (0..n * n).map(|_| unbounded()).collect(),
        });
        let members: Arc<[usize]> = (0..n).collect();
        (0..n)
            .map(|rank| LocalComm {
                mesh: Arc::clone(&mesh),
                members: Arc::clone(&members),
                rank,
                ctx: 0,
                splits: AtomicU64::new(0),
                timeout,
            })
            .collect()
    }

    /// Run `body` once per rank on scoped threads and collect the results
    /// in rank order. The harness every integration test uses.
    pub fn run<T, F>(n: usize, body: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Sync,
    {
        let comms = Self::new(n);
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

/// One rank's endpoint in a [`LocalGroup`] (or in a split subgroup).
pub struct LocalComm {
    mesh: Arc<Mesh>,
    /// Mesh ranks of this communicator's members, in communicator order.
    members: Arc<[usize]>,
    /// My rank within `members`.
    rank: usize,
    ctx: u64,
    splits: AtomicU64,
    timeout: Duration,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl LocalComm {
    fn check_peer(&self, peer: usize) -> CommResult<usize> {
        self.members
            .get(peer)
            .copied()
            .ok_or(CommError::InvalidPeer {
                peer,
                size: self.members.len(),
            })
    }

    /// Deterministic context id for the subgroup produced by split number
    /// `seq` under `color`. Every member computes the same value locally.
    fn child_ctx(&self, seq: u64, color: u32) -> u64 {
        self.ctx
            .rotate_left(23)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            ^ ((seq + 1) << 32)
            ^ u64::from(color + 1)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, to: usize, tag: u32, data: &[u8]) -> CommResult<()> {
        let to_mesh = self.check_peer(to)?;
        let me_mesh = self.members[self.rank];
        tracing::trace!(
            target: "comm.local",
            from = self.rank,
            to,
            tag,
            len = data.len(),
            "send"
        );
        self.mesh
            .lane(me_mesh, to_mesh)
            .0
            .send(Packet {
                ctx: self.ctx,
                tag,
                data: data.into(),
            })
            .map_err(|_| CommError::Disconnected { peer: to })
    }

    fn recv(&self, from: usize, tag: u32, buf: &mut [u8]) -> CommResult<()> {
        let from_mesh = self.check_peer(from)?;
        let me_mesh = self.members[self.rank];
        let packet = self
            .mesh
            .lane(from_mesh, me_mesh)
            .1
            .recv_timeout(self.timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => CommError::Timeout {
                    peer: from,
                    tag,
                    timeout: self.timeout,
                },
                RecvTimeoutError::Disconnected => CommError::Disconnected { peer: from },
            })?;
        if packet.ctx != self.ctx || packet.tag != tag || packet.data.len() != buf.len() {
            return Err(CommError::Protocol {
                peer: from,
                expected_tag: tag,
                expected_len: buf.len(),
                got_tag: packet.tag,
                got_len: packet.data.len(),
            });
        }
        buf.copy_from_slice(&packet.data);
        Ok(())
    }

    fn split(&self, color: Option<u32>, key: u32) -> CommResult<Option<Box<dyn Communicator>>> {
        // Everyone learns everyone's vote, then each rank derives its own
        // subgroup locally; no leader required.
        let n = self.size();
        let mut votes = vec![0u8; 12 * n];
        // The vote exchange reuses the point-to-point lanes under a
        // reserved tag so it cannot collide with schedule traffic.
        let vote = encode_split_vote(color, key);
        for to in 0..n {
            if to != self.rank {
                self.send(to, TAG_SPLIT, &vote)?;
            }
        }
        votes[self.rank * 12..(self.rank + 1) * 12].copy_from_slice(&vote);
        for from in 0..n {
            if from != self.rank {
                self.recv(from, TAG_SPLIT, &mut votes[from * 12..(from + 1) * 12])?;
            }
        }

        let seq = self.splits.fetch_add(1, Ordering::Relaxed);
        let Some(my_color) = color else {
            return Ok(None);
        };

        // Members of my color, communicator-ordered by (key, old rank).
        let mut group: Vec<(u32, usize)> = (0..n)
            .filter_map(|r| {
                let (c, k) = decode_split_vote(&votes[r * 12..(r + 1) * 12]);
                (c == Some(my_color)).then_some((k, r))
            })
            .collect();
        group.sort_unstable();

        let new_rank = group
            .iter()
            .position(|&(_, r)| r == self.rank)
            .expect("splitting rank must be in its own color group");
        let members: Arc<[usize]> = group
            .iter()
            .map(|&(_, r)| self.members[r])
            .collect();

        tracing::debug!(
            target: "comm.local",
            rank = self.rank,
            color = my_color,
            key,
            new_rank,
            new_size = members.len(),
            "split"
        );

        Ok(Some(Box::new(LocalComm {
            mesh: Arc::clone(&self.mesh),
            members,
            rank: new_rank,
            ctx: self.child_ctx(seq, my_color),
            splits: AtomicU64::new(0),
            timeout: self.timeout,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GathervDest;

    #[test]
    fn ping_pong_between_two_ranks() {
        let results = LocalGroup::run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 7, b"ping").unwrap();
                let mut buf = [0u8; 4];
                comm.recv(1, 8, &mut buf).unwrap();
                buf.to_vec()
            } else {
                let mut buf = [0u8; 4];
                comm.recv(0, 7, &mut buf).unwrap();
                comm.send(0, 8, b"pong").unwrap();
                buf.to_vec()
            }
        });
        assert_eq!(results[0], b"pong");
        assert_eq!(results[1], b"ping");
    }

    #[test]
    fn exchange_is_symmetric() {
        let results = LocalGroup::run(2, |comm| {
            let me = comm.rank() as u8;
            let send = [me; 8];
            let mut recv = [0u8; 8];
            comm.exchange(1 - comm.rank(), 1, &send, 1, &mut recv)
                .unwrap();
            recv
        });
        assert_eq!(results[0], [1u8; 8]);
        assert_eq!(results[1], [0u8; 8]);
    }

    #[test]
    fn allgather_concatenates_in_rank_order() {
        let results = LocalGroup::run(5, |comm| {
            let send = [comm.rank() as u8 * 3];
            let mut recv = vec![0u8; 5];
            comm.allgather(&send, &mut recv).unwrap();
            recv
        });
        for r in results {
            assert_eq!(r, vec![0, 3, 6, 9, 12]);
        }
    }

    #[test]
    fn gather_collects_on_root_only() {
        let results = LocalGroup::run(4, |comm| {
            let send = [comm.rank() as u8; 2];
            if comm.rank() == 0 {
                let mut recv = vec![0u8; 8];
                comm.gather(0, &send, Some(&mut recv)).unwrap();
                Some(recv)
            } else {
                comm.gather(0, &send, None).unwrap();
                None
            }
        });
        assert_eq!(
            results[0].as_deref(),
            Some(&[0, 0, 1, 1, 2, 2, 3, 3][..])
        );
        assert!(results[1..].iter().all(|r| r.is_none()));
    }

    #[test]
    fn gatherv_places_ragged_contributions() {
        let results = LocalGroup::run(3, |comm| {
            let me = comm.rank();
            let send = vec![me as u8 + 1; me + 1];
            if me == 0 {
                let counts = [1usize, 2, 3];
                let displs = [0usize, 1, 3];
                let mut buf = vec![0u8; 6];
                comm.gatherv(
                    0,
                    &send,
                    Some(GathervDest {
                        counts: &counts,
                        displs: &displs,
                        buf: &mut buf,
                    }),
                )
                .unwrap();
                Some(buf)
            } else {
                comm.gatherv(0, &send, None).unwrap();
                None
            }
        });
        assert_eq!(results[0].as_deref(), Some(&[1, 2, 2, 3, 3, 3][..]));
    }

    #[test]
    fn split_orders_subgroups_by_key_then_rank() {
        // Even ranks go to color 0 keyed by descending rank, odd ranks to
        // color 1 keyed by rank.
        let results = LocalGroup::run(4, |comm| {
            let color = (comm.rank() % 2) as u32;
            let key = if color == 0 {
                (10 - comm.rank()) as u32
            } else {
                comm.rank() as u32
            };
            let sub = comm.split(Some(color), key).unwrap().unwrap();
            (comm.rank(), sub.rank(), sub.size())
        });
        // color 0 holds world ranks {0, 2}; key 10 and 8 reverse them.
        assert!(results.contains(&(0, 1, 2)));
        assert!(results.contains(&(2, 0, 2)));
        assert!(results.contains(&(1, 0, 2)));
        assert!(results.contains(&(3, 1, 2)));
    }

    #[test]
    fn split_with_no_color_yields_none_but_participates() {
        let results = LocalGroup::run(3, |comm| {
            let color = (comm.rank() != 2).then_some(0u32);
            let sub = comm.split(color, comm.rank() as u32).unwrap();
            sub.map(|s| (s.rank(), s.size()))
        });
        assert_eq!(results[0], Some((0, 2)));
        assert_eq!(results[1], Some((1, 2)));
        assert_eq!(results[2], None);
    }

    #[test]
    fn sub_communicator_traffic_does_not_leak_to_parent_tags() {
        let results = LocalGroup::run(2, |comm| {
            let sub = comm.split(Some(0), comm.rank() as u32).unwrap().unwrap();
            if sub.rank() == 0 {
                sub.send(1, 42, b"sub").unwrap();
                let mut buf = [0u8; 3];
                sub.recv(1, 43, &mut buf).unwrap();
                buf
            } else {
                let mut buf = [0u8; 3];
                sub.recv(0, 42, &mut buf).unwrap();
                sub.send(0, 43, b"bus").unwrap();
                buf
            }
        });
        assert_eq!(&results[0], b"bus");
        assert_eq!(&results[1], b"sub");
    }

    #[test]
    fn mismatched_tag_is_a_protocol_error() {
        let results = LocalGroup::run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 5, b"x").unwrap();
                Ok(())
            } else {
                let mut buf = [0u8; 1];
                comm.recv(0, 6, &mut buf)
            }
        });
        assert!(matches!(
            results[1],
            Err(CommError::Protocol {
                expected_tag: 6,
                got_tag: 5,
                ..
            })
        ));
    }

    #[test]
    fn recv_times_out_instead_of_hanging() {
        // Nobody ever sends on this lane; the receive must fail, not wedge.
        let comms = LocalGroup::with_timeout(2, Duration::from_millis(20));
        let mut buf = [0u8; 1];
        let got = comms[1].recv(0, 1, &mut buf);
        assert!(matches!(got, Err(CommError::Timeout { peer: 0, .. })));
    }
}
