//! Thin façade over intra-process (Rayon) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: callers must `.wait()`
//! before they trust that a buffer has arrived. A handle that resolves to
//! `None` means the peer never delivered, which the collective layers above
//! report as [`ParticleError::CollectiveDesync`].
//!
//! Collectives (`barrier`, `allgather`, `allreduce_*`, `exchange_all`) are
//! provided on top of point-to-point messages so every backend gets them for
//! free; the MPI backend overrides them with native collectives.

use crate::algs::exchange;
use crate::particle_error::ParticleError;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag `k` slots after this one.
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// Tags reserved by the library. Each collective uses `tag` for sizes and
/// `tag.offset(1)` for data.
pub mod tags {
    use super::CommTag;

    pub const ALLGATHER: CommTag = CommTag(0xC000);
    pub const SORT_MIGRATE: CommTag = CommTag(0xC010);
    pub const SORT_ACK: CommTag = CommTag(0xC020);
    pub const UNIQUE_IDS: CommTag = CommTag(0xC030);
}

/// Non-blocking communication interface.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive; `buf.len()` is the number of bytes expected. Longer
    /// messages are truncated.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// This process's rank.
    fn rank(&self) -> usize;
    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// Fixed all-to-all: `outgoing[r]` goes to rank `r` (the entry for this
    /// rank is copied locally) and the result holds what every rank sent here.
    /// Every rank must call this with the same `tag`, even with nothing to say.
    fn exchange_all(
        &self,
        tag: CommTag,
        outgoing: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, ParticleError> {
        exchange::sizes_then_data(self, tag, outgoing)
    }

    /// Gather one buffer from every rank, indexed by rank.
    fn allgather(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>, ParticleError> {
        let outgoing = vec![mine.to_vec(); self.size()];
        self.exchange_all(tags::ALLGATHER, outgoing)
    }

    /// Block until every rank has reached this point.
    fn barrier(&self) -> Result<(), ParticleError> {
        self.allgather(&[]).map(|_| ())
    }

    /// Global sum of one `u64` per rank.
    fn allreduce_sum(&self, value: u64) -> Result<u64, ParticleError> {
        let all = self.allgather(&value.to_le_bytes())?;
        decode_u64s(&all).map(|vals| vals.into_iter().fold(0u64, u64::saturating_add))
    }

    /// Global maximum of one `u64` per rank.
    fn allreduce_max(&self, value: u64) -> Result<u64, ParticleError> {
        let all = self.allgather(&value.to_le_bytes())?;
        decode_u64s(&all).map(|vals| vals.into_iter().max().unwrap_or(value))
    }
}

fn decode_u64s(all: &[Vec<u8>]) -> Result<Vec<u64>, ParticleError> {
    all.iter()
        .enumerate()
        .map(|(peer, raw)| {
            let bytes: [u8; 8] =
                raw.as_slice()
                    .try_into()
                    .map_err(|_| ParticleError::CollectiveDesync {
                        peer,
                        reason: format!("expected 8 bytes for reduction, got {}", raw.len()),
                    })?;
            Ok(u64::from_le_bytes(bytes))
        })
        .collect()
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Compile-time no-op comm for pure serial runs: one rank, no peers.
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

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / one thread per rank ---
type Key = (u64, usize, usize, u16); // (world, src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);
static NEXT_WORLD: AtomicU64 = AtomicU64::new(1);

/// Receive handle of [`RayonComm`]; polls the shared mailbox on `wait`.
pub struct LocalHandle {
    key: Key,
    len: usize,
    timeout: Option<Duration>,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(mut queue) = MAILBOX.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    let n = bytes.len().min(self.len);
                    return Some(bytes[..n].to_vec());
                }
            }
            if self.timeout.is_some_and(|t| start.elapsed() >= t) {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

/// How long a [`RayonComm`] receive waits before the peer counts as absent.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// In-process communicator: each rank runs on its own thread and messages
/// travel through a process-wide mailbox with FIFO order per
/// `(src, dst, tag)`. Ranks created by [`RayonComm::world`] only see each
/// other, so independent worlds (e.g. concurrent tests) never mix messages.
#[derive(Clone, Debug)]
pub struct RayonComm {
    world: u64,
    rank: usize,
    size: usize,
    timeout: Option<Duration>,
}

impl RayonComm {
    /// A fresh, isolated world of `size` ranks; element `r` is rank `r`.
    /// Receives give up after [`DEFAULT_RECV_TIMEOUT`].
    pub fn world(size: usize) -> Vec<Self> {
        let world = NEXT_WORLD.fetch_add(1, Ordering::Relaxed);
        (0..size)
            .map(|rank| Self {
                world,
                rank,
                size,
                timeout: Some(DEFAULT_RECV_TIMEOUT),
            })
            .collect()
    }

    /// Give up on a receive after `timeout`; `wait()` then yields `None`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for a peer indefinitely.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.world, self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            key: (self.world, peer, self.rank, tag),
            len: buf.len(),
            timeout: self.timeout,
        }
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
    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as _, CommunicatorCollectives, Destination, Source};
    use mpi::Count;
    use std::sync::Arc;

    /// Communicator over `MPI_COMM_WORLD`.
    ///
    /// Point-to-point sends complete eagerly (`MPI_Send`); the collectives
    /// used by the particle layers map onto native MPI collectives.
    #[derive(Clone)]
    pub struct MpiComm {
        _universe: Arc<Universe>,
        pub world: Arc<SimpleCommunicator>,
        pub rank: usize,
    }

    // One thread per rank drives MPI (see crate docs); the handle is only
    // moved, never used concurrently.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialize MPI; `None` if it was already initialized.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            Some(Self {
                _universe: Arc::new(universe),
                world: Arc::new(world),
                rank,
            })
        }
    }

    /// Deferred blocking receive.
    pub struct MpiRecv {
        world: Arc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
        len: usize,
    }

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            let (mut data, _status) = self
                .world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            data.truncate(self.len);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiRecv;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, i32::from(tag));
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecv {
            MpiRecv {
                world: Arc::clone(&self.world),
                peer: peer as i32,
                tag: i32::from(tag),
                len: buf.len(),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn exchange_all(
            &self,
            _tag: CommTag,
            outgoing: Vec<Vec<u8>>,
        ) -> Result<Vec<Vec<u8>>, ParticleError> {
            let n = self.size();
            let send_counts: Vec<Count> = outgoing.iter().map(|b| b.len() as Count).collect();
            let mut recv_counts = vec![0 as Count; n];
            self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

            let displs = |counts: &[Count]| -> Vec<Count> {
                counts
                    .iter()
                    .scan(0 as Count, |acc, &c| {
                        let d = *acc;
                        *acc += c;
                        Some(d)
                    })
                    .collect()
            };
            let send_displs = displs(&send_counts);
            let recv_displs = displs(&recv_counts);
            let flat: Vec<u8> = outgoing.concat();
            let total: usize = recv_counts.iter().map(|&c| c as usize).sum();
            let mut recv = vec![0u8; total];
            {
                let send_part = Partition::new(&flat[..], &send_counts[..], &send_displs[..]);
                let mut recv_part =
                    PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&send_part, &mut recv_part);
            }
            Ok(recv_displs
                .iter()
                .zip(&recv_counts)
                .map(|(&d, &c)| recv[d as usize..(d + c) as usize].to_vec())
                .collect())
        }

        fn barrier(&self) -> Result<(), ParticleError> {
            self.world.barrier();
            Ok(())
        }

        fn allreduce_sum(&self, value: u64) -> Result<u64, ParticleError> {
            let mut out = 0u64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::sum());
            Ok(out)
        }

        fn allreduce_max(&self, value: u64) -> Result<u64, ParticleError> {
            let mut out = 0u64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::max());
            Ok(out)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
