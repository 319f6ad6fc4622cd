//! Thin façade over intra-process (test) or inter-process (MPI) message
//! passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). All
//! handles are **waitable** but non-blocking — the cycle engine calls
//! `.wait()` before it trusts that a buffer is ready.
//!
//! On top of the two point-to-point primitives the trait provides the
//! blocking collectives the setup protocol needs (gather, variable-length
//! gather, broadcast, all-reduce). They are implemented with an explicit
//! ack rendezvous so that a mailbox-backed in-process backend can never
//! overwrite a message that a slow peer has not consumed yet; a process
//! cannot start round *n + 1* of a collective before every peer has
//! finished round *n*.

pub mod wire;

use crate::flow_error::FlowError;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use self::wire::{WireFlag, WireScalar, cast_slice, decode_slice};

/// Tag bit reserved for the internal ack leg of a collective.
const ACK_BIT: u16 = 0x8000;

/// Typed message tag. Collectives consume a small contiguous range starting
/// at the base tag; keep bases at least 8 apart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(base: u16) -> Self {
        debug_assert!(base & ACK_BIT == 0);
        Self(base)
    }
    pub fn as_u16(&self) -> u16 {
        self.0
    }
    /// Derive the tag for a later phase of the same protocol.
    pub fn offset(&self, n: u16) -> Self {
        Self((self.0 + n) & !ACK_BIT)
    }
    fn ack(&self) -> u16 {
        self.0 | ACK_BIT
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Element-wise reduction operator for scalar all-reduce.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

fn recv_failed(neighbor: usize, what: &str) -> FlowError {
    FlowError::CommError {
        neighbor,
        source: format!("failed to receive {what} from rank {neighbor}").into(),
    }
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// This process's rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of cooperating processes.
    fn size(&self) -> usize;

    /// Gather one `T` from every rank onto `root`.
    ///
    /// Returns `Some(values)` (indexed by source rank) on the root and
    /// `None` elsewhere.
    fn gather<T: Pod>(
        &self,
        value: T,
        root: usize,
        tag: CommTag,
    ) -> Result<Option<Vec<T>>, FlowError> {
        if self.size() == 1 {
            return Ok(Some(vec![value]));
        }
        if self.rank() == root {
            let elem = std::mem::size_of::<T>();
            let mut pending = Vec::with_capacity(self.size() - 1);
            for peer in (0..self.size()).filter(|&p| p != root) {
                let mut buf = vec![0u8; elem];
                let h = self.irecv(peer, tag.as_u16(), &mut buf);
                pending.push((peer, h));
            }
            let mut out = vec![T::zeroed(); self.size()];
            out[root] = value;
            for (peer, h) in pending {
                let data = h.wait().ok_or_else(|| recv_failed(peer, "gather value"))?;
                out[peer] = bytemuck::pod_read_unaligned(&data);
            }
            let acks: Vec<_> = (0..self.size())
                .filter(|&p| p != root)
                .map(|peer| self.isend(peer, tag.ack(), &[0xAC]))
                .collect();
            for a in acks {
                let _ = a.wait();
            }
            Ok(Some(out))
        } else {
            let s = self.isend(root, tag.as_u16(), cast_slice(std::slice::from_ref(&value)));
            let mut ack = [0u8; 1];
            let h = self.irecv(root, tag.ack(), &mut ack);
            h.wait().ok_or_else(|| recv_failed(root, "gather ack"))?;
            let _ = s.wait();
            Ok(None)
        }
    }

    /// Variable-length gather of `items` onto `root`.
    ///
    /// The root must pass the per-rank element counts (typically the result
    /// of a prior [`gather`](Self::gather) of lengths); other ranks pass
    /// `None`. Returns the concatenation in rank order on the root.
    fn gather_v<T: Pod>(
        &self,
        items: &[T],
        counts: Option<&[usize]>,
        root: usize,
        tag: CommTag,
    ) -> Result<Option<Vec<T>>, FlowError> {
        if self.size() == 1 {
            return Ok(Some(items.to_vec()));
        }
        if self.rank() == root {
            let counts = counts.expect("root must supply per-rank counts for gather_v");
            let elem = std::mem::size_of::<T>();
            let mut pending = Vec::with_capacity(self.size() - 1);
            for peer in (0..self.size()).filter(|&p| p != root) {
                let mut buf = vec![0u8; counts[peer] * elem];
                let h = if counts[peer] > 0 {
                    Some(self.irecv(peer, tag.as_u16(), &mut buf))
                } else {
                    None
                };
                pending.push((peer, h, buf));
            }
            let mut per_rank: Vec<Vec<T>> = vec![Vec::new(); self.size()];
            per_rank[root] = items.to_vec();
            for (peer, h, buf) in pending {
                let data = match h {
                    Some(h) => h
                        .wait()
                        .ok_or_else(|| recv_failed(peer, "gather_v payload"))?,
                    None => buf,
                };
                per_rank[peer] = decode_slice::<T>(&data);
            }
            let acks: Vec<_> = (0..self.size())
                .filter(|&p| p != root)
                .map(|peer| self.isend(peer, tag.ack(), &[0xAC]))
                .collect();
            for a in acks {
                let _ = a.wait();
            }
            Ok(Some(per_rank.concat()))
        } else {
            let s = if items.is_empty() {
                None
            } else {
                Some(self.isend(root, tag.as_u16(), cast_slice(items)))
            };
            let mut ack = [0u8; 1];
            let h = self.irecv(root, tag.ack(), &mut ack);
            h.wait().ok_or_else(|| recv_failed(root, "gather_v ack"))?;
            if let Some(s) = s {
                let _ = s.wait();
            }
            Ok(None)
        }
    }

    /// Broadcast `value` from `root` to every rank. Non-root ranks pass a
    /// placeholder (e.g. `T::zeroed()`); every rank returns the root's value.
    fn broadcast<T: Pod>(&self, value: T, root: usize, tag: CommTag) -> Result<T, FlowError> {
        if self.size() == 1 {
            return Ok(value);
        }
        if self.rank() == root {
            let sends: Vec<_> = (0..self.size())
                .filter(|&p| p != root)
                .map(|peer| {
                    self.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&value)))
                })
                .collect();
            let mut pending = Vec::with_capacity(self.size() - 1);
            for peer in (0..self.size()).filter(|&p| p != root) {
                let mut ack = [0u8; 1];
                pending.push((peer, self.irecv(peer, tag.ack(), &mut ack)));
            }
            for (peer, h) in pending {
                h.wait()
                    .ok_or_else(|| recv_failed(peer, "broadcast ack"))?;
            }
            for s in sends {
                let _ = s.wait();
            }
            Ok(value)
        } else {
            let mut buf = vec![0u8; std::mem::size_of::<T>()];
            let h = self.irecv(root, tag.as_u16(), &mut buf);
            let data = h
                .wait()
                .ok_or_else(|| recv_failed(root, "broadcast payload"))?;
            let out = bytemuck::pod_read_unaligned(&data);
            let s = self.isend(root, tag.ack(), &[0xAC]);
            let _ = s.wait();
            Ok(out)
        }
    }

    /// Logical-or all-reduce of one flag. Every rank returns the global OR.
    fn all_reduce_or(&self, flag: bool, tag: CommTag) -> Result<bool, FlowError> {
        if self.size() == 1 {
            return Ok(flag);
        }
        let gathered = self.gather(WireFlag::of(flag), 0, tag)?;
        let combined = gathered.map(|flags| flags.iter().any(|f| f.get()));
        let out = self.broadcast(
            WireFlag::of(combined.unwrap_or(false)),
            0,
            tag.offset(2),
        )?;
        Ok(out.get())
    }

    /// Element-wise all-reduce of a short scalar vector. Every rank passes a
    /// slice of the same length and receives the combined result.
    fn all_reduce_scalars(
        &self,
        values: &[f64],
        op: ReduceOp,
        tag: CommTag,
    ) -> Result<Vec<f64>, FlowError> {
        if self.size() == 1 {
            return Ok(values.to_vec());
        }
        let wired: Vec<WireScalar> = values.iter().map(|&v| WireScalar::of(v)).collect();
        let counts = vec![values.len(); self.size()];
        let gathered = self.gather_v(&wired, Some(&counts), 0, tag)?;
        let mut combined = vec![WireScalar::of(0.0); values.len()];
        if let Some(all) = gathered {
            let mut chunks = all.chunks_exact(values.len());
            let mut acc: Vec<f64> = chunks
                .next()
                .map(|first| first.iter().map(WireScalar::get).collect())
                .unwrap_or_default();
            for chunk in chunks {
                for (a, w) in acc.iter_mut().zip(chunk) {
                    *a = op.apply(*a, w.get());
                }
            }
            for (c, v) in combined.iter_mut().zip(&acc) {
                *c = WireScalar::of(*v);
            }
        }
        let mut out = Vec::with_capacity(values.len());
        // Broadcast element-by-element keeps the wire records fixed-size.
        for (i, c) in combined.iter().enumerate() {
            out.push(self.broadcast(*c, 0, tag.offset(2 + i as u16))?.get());
        }
        Ok(out)
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

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

// --- RayonComm: intra-process multi-rank, for tests ---

type Key = (usize, usize, u16); // (src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, Bytes>> = Lazy::new(DashMap::new);

pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock().unwrap();
        guard.take()
    }
}

/// In-process communicator: each "rank" lives on its own thread and
/// exchanges messages through a global mailbox. Tests that use it must run
/// serially (`#[serial]`) because the mailbox is shared per process.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Drop any message left over from an aborted earlier test.
    pub fn reset_mailbox() {
        MAILBOX.clear();
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        MAILBOX.insert(key, Bytes::from(buf.to_vec()));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LocalHandle {
        let key = (peer, self.rank, tag);
        let slot = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let want = buf.len();
        let handle = std::thread::spawn(move || {
            loop {
                if let Some(bytes) = MAILBOX.remove(&key).map(|(_, v)| v) {
                    let n = want.min(bytes.len());
                    let mut guard = slot_clone.lock().unwrap();
                    *guard = Some(bytes[..n].to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: slot,
            handle: Some(handle),
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
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// Ownership wrapper over the MPI world communicator. Any failure in the
    /// underlying substrate aborts the whole process group (there is no
    /// partial-failure story in a tightly coupled stencil computation).
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        _universe: mpi::environment::Universe,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let universe = mpi::initialize().expect("MPI initialization failed");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                world,
                rank,
                size,
                _universe: universe,
            }
        }
    }

    pub struct MpiSendHandle {
        // Buffer leaked into the request's static scope; reclaimed on wait.
        buf: *mut [u8],
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
    }
    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            drop(unsafe { Box::from_raw(self.buf) });
            None
        }
    }

    pub struct MpiRecvHandle {
        buf: *mut [u8],
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
    }
    unsafe impl Send for MpiRecvHandle {}

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            let boxed = unsafe { Box::from_raw(self.buf) };
            Some(boxed.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr = leaked as *mut [u8];
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(mpi::request::StaticScope, &*leaked, tag as i32);
            MpiSendHandle {
                buf: ptr,
                req: Some(req),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            let leaked: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let ptr = leaked as *mut [u8];
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(mpi::request::StaticScope, leaked, tag as i32);
            MpiRecvHandle {
                buf: ptr,
                req: Some(req),
            }
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
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rayon_roundtrip_two_ranks() {
        RayonComm::reset_mailbox();
        let comm0 = RayonComm::new(0, 2);
        let comm1 = RayonComm::new(1, 2);

        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);
        comm0.isend(1, 7, &[1, 2, 3, 4]);

        let data = recv_handle.wait().expect("expected data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    #[serial]
    fn gather_collects_in_rank_order() {
        RayonComm::reset_mailbox();
        let mut joins = Vec::new();
        for rank in 1..3usize {
            joins.push(std::thread::spawn(move || {
                let comm = RayonComm::new(rank, 3);
                let r = comm.gather(wire::WireBlockId::of(rank as u64 * 10), 0, CommTag::new(40));
                assert!(matches!(r, Ok(None)));
            }));
        }
        let comm = RayonComm::new(0, 3);
        let out = comm
            .gather(wire::WireBlockId::of(0), 0, CommTag::new(40))
            .unwrap()
            .unwrap();
        let ids: Vec<u64> = out.iter().map(|w| w.get()).collect();
        assert_eq!(ids, vec![0, 10, 20]);
        for j in joins {
            j.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn all_reduce_or_any_rank_sets_flag() {
        RayonComm::reset_mailbox();
        let mut joins = Vec::new();
        for rank in 1..3usize {
            joins.push(std::thread::spawn(move || {
                let comm = RayonComm::new(rank, 3);
                let flag = rank == 2;
                assert!(comm.all_reduce_or(flag, CommTag::new(60)).unwrap());
            }));
        }
        let comm = RayonComm::new(0, 3);
        assert!(comm.all_reduce_or(false, CommTag::new(60)).unwrap());
        for j in joins {
            j.join().unwrap();
        }
    }

    #[test]
    fn no_comm_collectives_are_local() {
        let comm = NoComm;
        assert_eq!(
            comm.gather(wire::WireFlag::of(true), 0, CommTag::new(1))
                .unwrap()
                .unwrap()
                .len(),
            1
        );
        assert!(!comm.all_reduce_or(false, CommTag::new(2)).unwrap());
        let sums = comm
            .all_reduce_scalars(&[1.5, -2.0], ReduceOp::Sum, CommTag::new(3))
            .unwrap();
        assert_eq!(sums, vec![1.5, -2.0]);
    }
}
