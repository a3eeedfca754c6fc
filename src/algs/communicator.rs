//! Thin façade over intra-process (threaded loopback) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking; the exchange engines call
//! `.wait()` before they trust that a buffer is ready or may be released.
//!
//! Only four capabilities are required from a backend: post a receive, post a
//! send, wait on either, and a collective barrier. Engines always post every
//! receive of a transfer before the barrier, and every send after it.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Barrier};

/// Non-blocking point-to-point communication plus a barrier.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`. The payload is captured before returning.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of `buf.len()` bytes from `peer`; the data is returned by `wait`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;
    /// Block until every rank of the group has reached the barrier.
    fn barrier(&self);
    /// Rank of the calling process.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag. One tag per class of exchange; concurrently in-flight
/// unrelated exchanges must use distinct tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `k` steps after this one (wrapping).
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Default tag for gathers.
pub const GATHER_TAG: CommTag = CommTag(100);
/// Default tag for scatters.
pub const SCATTER_TAG: CommTag = CommTag(101);
/// Default tag for halo updates.
pub const HALO_TAG: CommTag = CommTag(0x4A10);
/// Default tags for the halo setup handshake.
pub const HALO_SETUP_TAGS: HaloSetupTags = HaloSetupTags::from_base(CommTag(0x4A20));

/// Tags for the two phases of the halo setup handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HaloSetupTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl HaloSetupTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for pure serial unit tests.
///
/// Sends are dropped and receives complete without data, so it only suits
/// code paths that post nothing (or that must fail before posting).
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn barrier(&self) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    slots: Mutex<HashMap<Key, VecDeque<Bytes>>>,
    arrived: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, data: Bytes) {
        let mut slots = self.slots.lock();
        slots.entry(key).or_default().push_back(data);
        self.arrived.notify_all();
    }

    fn take(&self, key: Key) -> Bytes {
        let mut slots = self.slots.lock();
        loop {
            if let Some(queue) = slots.get_mut(&key) {
                if let Some(data) = queue.pop_front() {
                    if queue.is_empty() {
                        slots.remove(&key);
                    }
                    return data;
                }
            }
            self.arrived.wait(&mut slots);
        }
    }
}

struct Group {
    mailbox: Mailbox,
    barrier: Barrier,
}

/// In-memory loopback group: every rank lives on its own thread of one process.
///
/// Messages between a (src, dst, tag) triple are delivered in FIFO order.
/// `barrier` blocks until all ranks of the group arrive, so each rank of a
/// group larger than one must run on a separate thread.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    group: Arc<Group>,
}

impl RayonComm {
    /// Create the `size` ranks of a fresh group, in rank order.
    pub fn group(size: usize) -> Vec<Self> {
        let group = Arc::new(Group {
            mailbox: Mailbox::default(),
            barrier: Barrier::new(size.max(1)),
        });
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                group: Arc::clone(&group),
            })
            .collect()
    }
}

impl fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

pub struct LocalHandle {
    group: Arc<Group>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.group.mailbox.take(self.key).to_vec())
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.group.mailbox.post(key, Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            group: Arc::clone(&self.group),
            key: (peer, self.rank, tag),
        }
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use crate::exchange_error::ExchangeError;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI world communicator. Finalizes MPI when dropped.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        pub size: usize,
        _universe: Universe,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, ExchangeError> {
            let universe = mpi::initialize().ok_or(ExchangeError::CommunicationFailure {
                peer: 0,
                reason: "MPI was already initialized".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Pending MPI request over a heap buffer owned by the handle.
    ///
    /// The buffer is released in `wait`; dropping an unwaited handle leaks it.
    pub struct MpiHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
        recv: bool,
    }

    impl MpiHandle {
        fn leak(data: Vec<u8>) -> (*mut [u8], &'static mut [u8]) {
            let ptr = Box::into_raw(data.into_boxed_slice());
            // SAFETY: `ptr` comes from `Box::into_raw` and is only reclaimed
            // in `wait`, after the request holding this borrow has completed.
            (ptr, unsafe { &mut *ptr })
        }
    }

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let status = self.req.wait();
            // SAFETY: the request completed, so MPI no longer touches the buffer
            // and no other reference to it remains.
            let mut data = unsafe { Box::from_raw(self.buf) }.into_vec();
            if !self.recv {
                return None;
            }
            // The buffer is sized for the expected message; report what actually arrived.
            let arrived = status.count(u8::equivalent_datatype());
            data.truncate(usize::try_from(arrived).unwrap_or(data.len()));
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let (ptr, data) = MpiHandle::leak(buf.to_vec());
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, &*data, tag as i32);
            MpiHandle {
                req,
                buf: ptr,
                recv: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let (ptr, data) = MpiHandle::leak(vec![0u8; buf.len()]);
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                req,
                buf: ptr,
                recv: true,
            }
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_roundtrip_two_ranks() {
        let comms = RayonComm::group(2);
        let (comm0, comm1) = (&comms[0], &comms[1]);

        // Prepare a 4-byte receive buffer on "rank 1" and post the receive first.
        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);

        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn tags_keep_messages_apart() {
        let comms = RayonComm::group(2);
        comms[0].isend(1, 2, &[22]);
        comms[0].isend(1, 1, &[11]);
        let mut b = [0u8; 1];
        assert_eq!(comms[1].irecv(0, 1, &mut b).wait(), Some(vec![11]));
        assert_eq!(comms[1].irecv(0, 2, &mut b).wait(), Some(vec![22]));
    }

    #[test]
    fn groups_do_not_share_mailboxes() {
        let a = RayonComm::group(2);
        let b = RayonComm::group(2);
        a[0].isend(1, 3, &[1]);
        b[0].isend(1, 3, &[2]);
        let mut buf = [0u8; 1];
        assert_eq!(b[1].irecv(0, 3, &mut buf).wait(), Some(vec![2]));
        assert_eq!(a[1].irecv(0, 3, &mut buf).wait(), Some(vec![1]));
    }

    #[test]
    fn self_send_single_rank() {
        let comm = RayonComm::group(1).remove(0);
        let mut buf = [0u8; 2];
        let h = comm.irecv(0, 5, &mut buf);
        comm.barrier();
        comm.isend(0, 5, &[9, 8]);
        assert_eq!(h.wait(), Some(vec![9, 8]));
        assert_eq!((comm.rank(), comm.size()), (0, 1));
    }

    #[test]
    fn no_comm_is_inert() {
        let comm = NoComm;
        let mut buf = [0u8; 1];
        assert_eq!(comm.irecv(0, 1, &mut buf).wait(), None);
        comm.barrier();
        assert_eq!(comm.size(), 1);
    }

    #[test]
    fn commtag_offsets() {
        let tags = HaloSetupTags::from_base(CommTag::new(u16::MAX));
        assert_eq!(tags.sizes.as_u16(), u16::MAX);
        assert_eq!(tags.data.as_u16(), 0);
    }
}
