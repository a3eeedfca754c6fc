//! Ghost ("halo") synchronization over fixed neighbour lists.
//!
//! A [`HaloExchange`] is built once per connectivity and executed many times.
//! Each execution copies the entries named by every send list to the
//! matching neighbour and writes what arrives into the receive slots of the
//! same view. Receive slots are validated never to alias sent entries, so
//! repeated executions with unchanged owned data produce identical halos.

use std::collections::HashSet;

use itertools::Itertools;
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::algs::communicator::{CommTag, Communicator, HALO_TAG, HaloSetupTags};
use crate::algs::exchange::{Route, TransferStats, exchange_bytes};
use crate::algs::wire::{WireCount, WireIndex, cast_slice, decode_records};
use crate::data::field_view::FieldView;
use crate::data::partition_index::PartitionIndex;
use crate::exchange_error::ExchangeError;

/// Entries exchanged with one neighbour rank.
///
/// `send[k]` on this rank pairs with `recv[k]` on `rank`, so both sides must
/// agree on list lengths and order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HaloNeighbor {
    pub rank: usize,
    /// Local entries packed for `rank`.
    pub send: Vec<usize>,
    /// Local halo slots filled from `rank`.
    pub recv: Vec<usize>,
}

/// Precomputed halo connectivity of one rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HaloExchange {
    neighbors: Vec<HaloNeighbor>,
    tag: CommTag,
}

impl HaloExchange {
    /// Validate and store neighbour lists, sorted by neighbour rank.
    ///
    /// # Errors
    /// [`ExchangeError::InvalidHalo`] for a repeated neighbour rank, a repeated
    /// receive slot, or a receive slot that also appears in a send list.
    pub fn new(mut neighbors: Vec<HaloNeighbor>) -> Result<Self, ExchangeError> {
        neighbors.sort_by_key(|n| n.rank);
        if let Some((a, _)) = neighbors.iter().tuple_windows().find(|(a, b)| a.rank == b.rank) {
            return Err(ExchangeError::InvalidHalo(format!(
                "neighbour rank {} listed twice",
                a.rank
            )));
        }
        let mut recv_slots = HashSet::new();
        for n in &neighbors {
            if let Some(slot) = n.recv.iter().find(|&&s| !recv_slots.insert(s)) {
                return Err(ExchangeError::InvalidHalo(format!(
                    "receive slot {slot} filled more than once"
                )));
            }
        }
        let sent: HashSet<usize> = neighbors.iter().flat_map(|n| n.send.iter().copied()).collect();
        let mut received = neighbors.iter().flat_map(|n| n.recv.iter());
        if let Some(slot) = received.find(|&s| sent.contains(s)) {
            return Err(ExchangeError::InvalidHalo(format!(
                "receive slot {slot} is also sent"
            )));
        }
        Ok(Self {
            neighbors,
            tag: HALO_TAG,
        })
    }

    pub fn with_tag(mut self, tag: CommTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn tag(&self) -> CommTag {
        self.tag
    }

    pub fn neighbors(&self) -> &[HaloNeighbor] {
        &self.neighbors
    }

    /// Derive the connectivity from ghost slots and the global index each
    /// one mirrors.
    ///
    /// Collective: every rank of `comm` must call it. Ranks first exchange
    /// request counts with every peer, then send each owner the global
    /// indices they need; owners resolve them to local offsets
    /// (`location_of(g).local`), which become their send lists.
    pub fn from_ghosts<C: Communicator>(
        comm: &C,
        index: &PartitionIndex,
        ghosts: &[(usize, usize)],
        tags: HaloSetupTags,
    ) -> Result<Self, ExchangeError> {
        let me = comm.rank();
        let nb = index.nb_partitions();
        if comm.size() != nb {
            return Err(ExchangeError::CommunicatorMismatch {
                comm_size: comm.size(),
                nb_partitions: nb,
            });
        }

        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); nb];
        let mut slots: Vec<Vec<usize>> = vec![Vec::new(); nb];
        for &(slot, global) in ghosts {
            let loc = index.location_of(global).ok_or(ExchangeError::IndexOutOfBounds {
                index: global,
                len: index.len(),
            })?;
            requests[loc.rank].push(global);
            slots[loc.rank].push(slot);
        }

        // phase 1: request counts, one record to and from every peer
        let counts = requests
            .iter()
            .enumerate()
            .map(|(peer, r)| {
                WireCount::new(r.len()).ok_or_else(|| {
                    ExchangeError::InvalidHalo(format!(
                        "{} ghost requests for rank {peer} exceed the wire count range",
                        r.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count_size = size_of::<WireCount>();
        let all_peers: Vec<Route> = (0..nb)
            .map(|peer| Route {
                peer,
                range: peer * count_size..(peer + 1) * count_size,
            })
            .collect();
        let mut incoming = vec![0u8; nb * count_size];
        exchange_bytes(
            comm,
            tags.sizes,
            cast_slice(&counts),
            &all_peers,
            &mut incoming,
            &all_peers,
        )?;
        let incoming: Vec<usize> = decode_records::<WireCount>(&incoming)
            .iter()
            .map(WireCount::get)
            .collect();
        log::debug!(
            "halo setup on rank {me}: requesting {:?}, asked for {incoming:?}",
            requests.iter().map(Vec::len).collect::<Vec<_>>()
        );

        // phase 2: the requested global indices themselves
        let idx_size = size_of::<WireIndex>();
        let outgoing: Vec<WireIndex> = requests.iter().flatten().map(|&g| WireIndex::of(g)).collect();
        let sends = routes_for(requests.iter().map(Vec::len), idx_size);
        let recvs = routes_for(incoming.iter().copied(), idx_size);
        let mut asked = vec![0u8; incoming.iter().sum::<usize>() * idx_size];
        exchange_bytes(
            comm,
            tags.data,
            cast_slice(&outgoing),
            &sends,
            &mut asked,
            &recvs,
        )?;

        let mut send_lists: Vec<Vec<usize>> = vec![Vec::new(); nb];
        for route in &recvs {
            for wire in decode_records::<WireIndex>(&asked[route.range.clone()]) {
                let global = wire.get();
                match index.location_of(global) {
                    Some(loc) if loc.rank == me => send_lists[route.peer].push(loc.local),
                    _ => {
                        return Err(ExchangeError::InvalidHalo(format!(
                            "rank {} requested global {global} from rank {me}, which does not store it",
                            route.peer
                        )));
                    }
                }
            }
        }

        let neighbors = send_lists
            .into_iter()
            .zip(slots)
            .enumerate()
            .filter(|(_, (send, recv))| !send.is_empty() || !recv.is_empty())
            .map(|(rank, (send, recv))| HaloNeighbor { rank, send, recv })
            .collect();
        Self::new(neighbors)
    }

    /// Refresh the halo slots of `view`.
    ///
    /// Entry `i` covers elements `[i·e, (i+1)·e)` with `e = elements_per_entry`.
    ///
    /// # Errors
    /// Index and writability errors are raised before anything is posted to
    /// `comm`; [`ExchangeError::CommunicationFailure`] after all handles are
    /// drained.
    pub fn execute<C: Communicator>(
        &self,
        comm: &C,
        view: &mut FieldView<'_>,
        elements_per_entry: usize,
    ) -> Result<TransferStats, ExchangeError> {
        if elements_per_entry == 0 {
            return Err(ExchangeError::InvalidHalo(
                "entries must span at least one element".into(),
            ));
        }
        if let Some(n) = self.neighbors.iter().find(|n| n.rank >= comm.size()) {
            return Err(ExchangeError::InvalidHalo(format!(
                "neighbour rank {} outside a group of {}",
                n.rank,
                comm.size()
            )));
        }
        let entries = view.len() / elements_per_entry;
        let mut all_slots = self
            .neighbors
            .iter()
            .flat_map(|n| n.send.iter().chain(&n.recv));
        if let Some(&index) = all_slots.find(|&&i| i >= entries) {
            return Err(ExchangeError::IndexOutOfBounds {
                index,
                len: entries,
            });
        }
        let receives = self.neighbors.iter().any(|n| !n.recv.is_empty());
        if receives && !view.is_writable() {
            return Err(ExchangeError::ReadOnlyView { field: 0 });
        }

        let entry = elements_per_entry * view.elem_size();
        let send_slots: Vec<usize> = self.neighbors.iter().flat_map(|n| n.send.iter().copied()).collect();
        let mut send_buf = vec![0u8; send_slots.len() * entry];
        if entry > 0 {
            let src = view.as_bytes();
            let copy = |(out, &i): (&mut [u8], &usize)| {
                out.copy_from_slice(&src[i * entry..(i + 1) * entry])
            };
            #[cfg(feature = "rayon")]
            send_buf
                .par_chunks_exact_mut(entry)
                .zip(send_slots.par_iter())
                .for_each(copy);
            #[cfg(not(feature = "rayon"))]
            send_buf
                .chunks_exact_mut(entry)
                .zip(send_slots.iter())
                .for_each(copy);
        }

        let sends = self.routes(|n| n.send.len(), entry);
        let recvs = self.routes(|n| n.recv.len(), entry);
        let mut recv_buf = vec![0u8; recvs.last().map_or(0, |r| r.range.end)];
        log::debug!(
            "halo on rank {}: {} neighbours, send {} bytes, receive {} bytes",
            comm.rank(),
            self.neighbors.len(),
            send_buf.len(),
            recv_buf.len()
        );
        let stats = exchange_bytes(comm, self.tag, &send_buf, &sends, &mut recv_buf, &recvs)?;

        if entry > 0 {
            if let Some(dst) = view.as_bytes_mut() {
                let recv_slots = self.neighbors.iter().flat_map(|n| n.recv.iter());
                for (data, &i) in recv_buf.chunks_exact(entry).zip(recv_slots) {
                    dst[i * entry..(i + 1) * entry].copy_from_slice(data);
                }
            }
        }
        Ok(stats)
    }

    /// One route per neighbour in list order, skipping empty ones.
    fn routes(&self, len: impl Fn(&HaloNeighbor) -> usize, entry: usize) -> Vec<Route> {
        let mut offset = 0;
        self.neighbors
            .iter()
            .filter_map(|n| {
                let bytes = len(n) * entry;
                let route = Route {
                    peer: n.rank,
                    range: offset..offset + bytes,
                };
                offset += bytes;
                (bytes > 0).then_some(route)
            })
            .collect()
    }
}

/// Routes laying out `counts[p]` records of `size` bytes per peer, in rank order.
fn routes_for(counts: impl Iterator<Item = usize>, size: usize) -> Vec<Route> {
    let mut offset = 0;
    counts
        .enumerate()
        .filter_map(|(peer, n)| {
            let range = offset..offset + n * size;
            offset = range.end;
            (n > 0).then_some(Route { peer, range })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{HALO_SETUP_TAGS, NoComm, RayonComm};

    fn neighbor(rank: usize, send: &[usize], recv: &[usize]) -> HaloNeighbor {
        HaloNeighbor {
            rank,
            send: send.to_vec(),
            recv: recv.to_vec(),
        }
    }

    #[test]
    fn connectivity_validation() {
        let dup_rank = HaloExchange::new(vec![neighbor(1, &[0], &[]), neighbor(1, &[1], &[])]);
        assert!(matches!(dup_rank, Err(ExchangeError::InvalidHalo(_))));

        let dup_slot = HaloExchange::new(vec![neighbor(1, &[], &[4]), neighbor(2, &[], &[4])]);
        assert!(matches!(dup_slot, Err(ExchangeError::InvalidHalo(_))));

        let aliased = HaloExchange::new(vec![neighbor(1, &[4], &[]), neighbor(2, &[], &[4])]);
        assert!(matches!(aliased, Err(ExchangeError::InvalidHalo(_))));

        let ok = HaloExchange::new(vec![neighbor(2, &[0], &[5]), neighbor(1, &[0, 1], &[4])]).unwrap();
        assert_eq!(ok.neighbors()[0].rank, 1);
        assert_eq!(ok.tag(), HALO_TAG);
    }

    #[test]
    fn self_neighbour_copies_entries() {
        let comm = RayonComm::group(1).remove(0);
        let halo = HaloExchange::new(vec![neighbor(0, &[0, 2], &[4, 3])]).unwrap();
        // two elements per entry
        let mut data = [1i32, 2, 3, 4, 5, 6, 0, 0, 0, 0];
        let stats = halo
            .execute(&comm, &mut FieldView::from_slice_mut(&mut data, 0), 2)
            .unwrap();
        assert_eq!(data, [1, 2, 3, 4, 5, 6, 5, 6, 1, 2]);
        assert_eq!(stats.bytes_sent, 16);

        halo.execute(&comm, &mut FieldView::from_slice_mut(&mut data, 0), 2)
            .unwrap();
        assert_eq!(data, [1, 2, 3, 4, 5, 6, 5, 6, 1, 2]);
    }

    #[test]
    fn out_of_range_entries_fail_before_posting() {
        let halo = HaloExchange::new(vec![neighbor(0, &[0], &[3])]).unwrap();
        let mut data = [0u8; 3];
        let err = halo
            .execute(&NoComm, &mut FieldView::from_slice_mut(&mut data, 0), 1)
            .unwrap_err();
        assert_eq!(err, ExchangeError::IndexOutOfBounds { index: 3, len: 3 });
    }

    #[test]
    fn read_only_view_rejected() {
        let halo = HaloExchange::new(vec![neighbor(0, &[0], &[1])]).unwrap();
        let data = [0u8; 2];
        let err = halo
            .execute(&NoComm, &mut FieldView::from_slice(&data, 0), 1)
            .unwrap_err();
        assert_eq!(err, ExchangeError::ReadOnlyView { field: 0 });
    }

    #[test]
    fn neighbour_outside_group_rejected() {
        let halo = HaloExchange::new(vec![neighbor(3, &[0], &[])]).unwrap();
        let mut data = [0u8; 2];
        assert!(matches!(
            halo.execute(&NoComm, &mut FieldView::from_slice_mut(&mut data, 0), 1),
            Err(ExchangeError::InvalidHalo(_))
        ));
    }

    #[test]
    fn ghosts_resolve_on_single_rank() {
        let comm = RayonComm::group(1).remove(0);
        let index = PartitionIndex::build(&[0, 0, 0], 1).unwrap();
        let halo = HaloExchange::from_ghosts(&comm, &index, &[(3, 2), (4, 0)], HALO_SETUP_TAGS).unwrap();
        assert_eq!(halo.neighbors(), &[neighbor(0, &[2, 0], &[3, 4])]);

        let mut data = [7.0f64, 8.0, 9.0, 0.0, 0.0];
        halo.execute(&comm, &mut FieldView::from_slice_mut(&mut data, 0), 1)
            .unwrap();
        assert_eq!(data, [7.0, 8.0, 9.0, 9.0, 7.0]);
    }

    #[test]
    fn unknown_ghost_global_rejected() {
        let comm = RayonComm::group(1).remove(0);
        let index = PartitionIndex::build(&[0, 0], 1).unwrap();
        let err = HaloExchange::from_ghosts(&comm, &index, &[(2, 5)], HALO_SETUP_TAGS).unwrap_err();
        assert_eq!(err, ExchangeError::IndexOutOfBounds { index: 5, len: 2 });
    }

    #[test]
    fn routes_skip_empty_peers() {
        let routes = routes_for([2, 0, 1].into_iter(), 8);
        assert_eq!(
            routes,
            vec![
                Route { peer: 0, range: 0..16 },
                Route { peer: 2, range: 16..24 }
            ]
        );
    }
}
