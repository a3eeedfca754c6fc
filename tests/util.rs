#![allow(dead_code)]
use std::cell::Cell;

use meshcomm::algs::communicator::{Communicator, RayonComm};
use meshcomm::data::partition_index::PartitionIndex;

/// 10 global indices over 3 ranks, counts `[4, 3, 3]`.
pub const SCENARIO: [usize; 10] = [0, 0, 1, 0, 1, 1, 2, 2, 0, 2];

pub fn scenario_index() -> PartitionIndex {
    PartitionIndex::build(&SCENARIO, 3).unwrap()
}

/// Run `f` once per rank of a fresh `size`-rank group, each rank on its own
/// thread. Results come back in rank order.
pub fn run_ranks<R: Send>(size: usize, f: impl Fn(RayonComm) -> R + Sync) -> Vec<R> {
    let comms = RayonComm::group(size);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Values of `rank`'s partition, in local-slot order.
pub fn local_values<T>(index: &PartitionIndex, rank: usize, value: impl Fn(usize) -> T) -> Vec<T> {
    index.globals_of(rank).iter().map(|&g| value(g)).collect()
}

/// Wraps a communicator and counts everything posted through it.
pub struct CountingComm<C> {
    pub inner: C,
    pub sends: Cell<usize>,
    pub recvs: Cell<usize>,
    pub barriers: Cell<usize>,
}

impl<C> CountingComm<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            sends: Cell::new(0),
            recvs: Cell::new(0),
            barriers: Cell::new(0),
        }
    }

    pub fn posted(&self) -> usize {
        self.sends.get() + self.recvs.get() + self.barriers.get()
    }
}

impl<C: Communicator> Communicator for CountingComm<C> {
    type SendHandle = C::SendHandle;
    type RecvHandle = C::RecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.sends.set(self.sends.get() + 1);
        self.inner.isend(peer, tag, buf)
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        self.recvs.set(self.recvs.get() + 1);
        self.inner.irecv(peer, tag, buf)
    }

    fn barrier(&self) {
        self.barriers.set(self.barriers.get() + 1);
        self.inner.barrier()
    }

    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}
