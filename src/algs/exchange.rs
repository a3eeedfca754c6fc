//! Deadlock-free byte exchange shared by gather, scatter and halo updates.
//!
//! 1. Post every non-empty receive, keyed by source rank.
//! 2. Barrier, so every send below finds its receive already posted.
//! 3. Post every non-empty send, keyed by destination rank.
//! 4. Wait all receives, checking each message against its planned length.
//! 5. Wait all sends.
//!
//! Handles are always drained, even after a failed receive, before the first
//! error is returned.

use std::ops::Range;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::expect_exact_len;
use crate::data::transfer_plan::TransferPlan;
use crate::exchange_error::ExchangeError;

/// Byte range of a buffer addressed to (or expected from) one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub peer: usize,
    pub range: Range<usize>,
}

/// One route per peer with a non-empty extent in `plan`, in rank order.
pub fn plan_routes(plan: &TransferPlan) -> Vec<Route> {
    plan.peers()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.len > 0)
        .map(|(peer, e)| Route {
            peer,
            range: e.range(),
        })
        .collect()
}

/// Volumes moved by one rank during one call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub messages_sent: usize,
    pub messages_received: usize,
}

impl std::ops::AddAssign for TransferStats {
    fn add_assign(&mut self, rhs: Self) {
        self.bytes_sent += rhs.bytes_sent;
        self.bytes_received += rhs.bytes_received;
        self.messages_sent += rhs.messages_sent;
        self.messages_received += rhs.messages_received;
    }
}

/// Move `send_buf[route.range]` to each send route's peer and fill
/// `recv_buf[route.range]` from each receive route's peer.
pub fn exchange_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    send_buf: &[u8],
    sends: &[Route],
    recv_buf: &mut [u8],
    recvs: &[Route],
) -> Result<TransferStats, ExchangeError> {
    let tag = tag.as_u16();
    let mut stats = TransferStats::default();

    // 1) post all receives
    let mut pending_recvs = Vec::with_capacity(recvs.len());
    for route in recvs.iter().filter(|r| !r.range.is_empty()) {
        log::trace!(
            "rank {} posts receive of {} bytes from {} (tag {tag})",
            comm.rank(),
            route.range.len(),
            route.peer
        );
        let h = comm.irecv(route.peer, tag, &mut recv_buf[route.range.clone()]);
        pending_recvs.push((route, h));
    }

    // 2) nobody sends before everyone has posted
    comm.barrier();

    // 3) post all sends
    let mut pending_sends = Vec::with_capacity(sends.len());
    for route in sends.iter().filter(|r| !r.range.is_empty()) {
        log::trace!(
            "rank {} sends {} bytes to {} (tag {tag})",
            comm.rank(),
            route.range.len(),
            route.peer
        );
        pending_sends.push(comm.isend(route.peer, tag, &send_buf[route.range.clone()]));
        stats.bytes_sent += route.range.len();
        stats.messages_sent += 1;
    }

    // 4) wait for all receives, keeping only the first error
    let mut maybe_err = None;
    for (route, h) in pending_recvs {
        let outcome = match h.wait() {
            Some(data) => expect_exact_len(route.peer, data.len(), route.range.len()).map(|_| data),
            None => Err(ExchangeError::CommunicationFailure {
                peer: route.peer,
                reason: "no data received".into(),
            }),
        };
        match outcome {
            Ok(data) if maybe_err.is_none() => {
                recv_buf[route.range.clone()].copy_from_slice(&data);
                stats.bytes_received += data.len();
                stats.messages_received += 1;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("rank {}: {e}; draining remaining handles", comm.rank());
                if maybe_err.is_none() {
                    maybe_err = Some(e);
                }
            }
        }
    }

    // 5) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn empty_routes_post_nothing() {
        let stats = exchange_bytes(&NoComm, CommTag::new(1), &[], &[], &mut [], &[]).unwrap();
        assert_eq!(stats, TransferStats::default());
    }

    #[test]
    fn missing_message_is_a_failure() {
        let mut buf = [0u8; 4];
        let recvs = [Route { peer: 0, range: 0..4 }];
        let err = exchange_bytes(&NoComm, CommTag::new(1), &[], &[], &mut buf, &recvs).unwrap_err();
        assert!(matches!(err, ExchangeError::CommunicationFailure { peer: 0, .. }));
    }

    #[test]
    fn self_loop_moves_bytes() {
        let comm = RayonComm::group(1).remove(0);
        let send = [1u8, 2, 3, 4, 5];
        let mut recv = [0u8; 5];
        let sends = [Route { peer: 0, range: 1..4 }];
        let recvs = [Route { peer: 0, range: 2..5 }];
        let stats = exchange_bytes(&comm, CommTag::new(9), &send, &sends, &mut recv, &recvs).unwrap();
        assert_eq!(recv, [0, 0, 2, 3, 4]);
        assert_eq!(stats.bytes_sent, stats.bytes_received);
    }

    #[test]
    fn wrong_length_detected() {
        let comm = RayonComm::group(1).remove(0);
        let mut recv = [0u8; 4];
        let sends = [Route { peer: 0, range: 0..2 }];
        let recvs = [Route { peer: 0, range: 0..4 }];
        let err = exchange_bytes(&comm, CommTag::new(9), &[7, 7], &sends, &mut recv, &recvs)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::CommunicationFailure { peer: 0, .. }));
        assert_eq!(recv, [0; 4]);
    }
}
