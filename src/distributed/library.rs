//! The collective-library primitive.
//!
//! A collective library (NCCL-style) gives every *device* its own
//! communicator handle: library rank = global rank, library size = total
//! rank count. Handles are joined through a rendezvous key that global rank 0
//! generates and broadcasts over the process group before anyone connects.
//!
//! [`InProcessLibrary`] implements the contract over a channel mesh. Its
//! handles find each other through a process-wide registry keyed by the
//! rendezvous key, so connecting never blocks.

use crate::distributed::process_group::{ChannelProcessGroup, ProcessGroup};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

/// Collectives issued by one device. Reductions are sums.
///
/// Handles belonging to different local devices may be driven concurrently
/// from different threads; one handle is only ever used by one thread at a
/// time.
pub trait CollectiveLibrary: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self) -> Result<()>;

    /// `send` holds `size()` blocks of `recv.len()` elements; block `i` of
    /// every rank is summed into `recv` of rank `i`.
    fn reduce_scatter(&self, send: &[f32], recv: &mut [f32]) -> Result<()>;

    /// Rank `i` contributes `counts[i]` elements; `recv` receives all
    /// contributions concatenated in rank order.
    fn all_gather_v(&self, send: &[f32], recv: &mut [f32], counts: &[usize]) -> Result<()>;

    /// In-place sum across all ranks.
    fn all_reduce(&self, buf: &mut [f32]) -> Result<()>;

    /// Overwrites `buf` everywhere with the contents on `root`.
    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()>;
}

const KEY_LEN: usize = 16;

/// Opaque identifier that lets library handles of one run find each other.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousKey([u8; KEY_LEN]);

impl RendezvousKey {
    pub const LEN: usize = KEY_LEN;

    /// A fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::LEN] = bytes.try_into().map_err(|_| SyncError::SizeMismatch {
            context: "rendezvous key",
            expected: Self::LEN,
            got: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    /// Generates the key on process 0 and hands the same key to every
    /// process.
    pub fn exchange(process_group: &dyn ProcessGroup) -> Result<Self> {
        let mut bytes = if process_group.my_rank() == 0 {
            Self::generate().as_bytes().to_vec()
        } else {
            Vec::new()
        };
        process_group.broadcast_bytes(&mut bytes, 0)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RendezvousKey(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Creates library handles. A backend that requests the library variant
/// needs one of these.
pub trait LibraryProvider: Send + Sync {
    fn connect(&self, key: &RendezvousKey, rank: usize, size: usize) -> Result<Box<dyn CollectiveLibrary>>;
}

/// Runs the rendezvous for the local devices of this process: exchanges the
/// key and connects one handle per local device, with library rank equal to
/// the device's global rank.
pub fn connect_local_devices(
    provider: &dyn LibraryProvider,
    process_group: &dyn ProcessGroup,
    devices_per_process: usize,
) -> Result<Vec<Box<dyn CollectiveLibrary>>> {
    let key = RendezvousKey::exchange(process_group)?;
    let size = process_group.num_processes() * devices_per_process;
    let first = process_group.my_rank() * devices_per_process;
    debug!(?key, size, first_rank = first, "connecting collective library");
    (first..first + devices_per_process)
        .map(|rank| provider.connect(&key, rank, size))
        .collect()
}

/// Pending handles of one rendezvous, taken by rank as devices connect.
struct Session {
    endpoints: Vec<Option<ChannelProcessGroup>>,
}

fn registry() -> &'static Mutex<HashMap<RendezvousKey, Session>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RendezvousKey, Session>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Provider for [`InProcessLibrary`] handles.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessProvider;

impl LibraryProvider for InProcessProvider {
    fn connect(&self, key: &RendezvousKey, rank: usize, size: usize) -> Result<Box<dyn CollectiveLibrary>> {
        Ok(Box::new(InProcessLibrary::connect(key, rank, size)?))
    }
}

/// A collective-library handle over an in-process channel mesh.
pub struct InProcessLibrary {
    mesh: ChannelProcessGroup,
}

impl InProcessLibrary {
    /// Joins the rendezvous `key` as `rank` of `size`.
    ///
    /// The first handle to connect creates the mesh; the session is dropped
    /// from the registry once every rank has taken its endpoint.
    pub fn connect(key: &RendezvousKey, rank: usize, size: usize) -> Result<Self> {
        if rank >= size {
            return Err(SyncError::InvalidConfig(format!(
                "library rank {rank} out of range for size {size}"
            )));
        }
        let mut sessions = registry().lock();
        if !sessions.contains_key(key) {
            let endpoints = ChannelProcessGroup::create(size)?.into_iter().map(Some).collect();
            sessions.insert(*key, Session { endpoints });
        }
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SyncError::Comm(format!("rendezvous {key:?} vanished")))?;
        if session.endpoints.len() != size {
            return Err(SyncError::Comm(format!(
                "rendezvous {key:?} has size {}, rank {rank} asked for {size}",
                session.endpoints.len()
            )));
        }
        let mesh = session.endpoints[rank]
            .take()
            .ok_or_else(|| SyncError::Comm(format!("rank {rank} already joined rendezvous {key:?}")))?;
        if session.endpoints.iter().all(Option::is_none) {
            sessions.remove(key);
        }
        Ok(Self { mesh })
    }
}

impl CollectiveLibrary for InProcessLibrary {
    fn rank(&self) -> usize {
        self.mesh.my_rank()
    }

    fn size(&self) -> usize {
        self.mesh.num_processes()
    }

    fn barrier(&self) -> Result<()> {
        self.mesh.barrier()
    }

    fn reduce_scatter(&self, send: &[f32], recv: &mut [f32]) -> Result<()> {
        self.mesh.reduce_scatter_block(send, recv)
    }

    fn all_gather_v(&self, send: &[f32], recv: &mut [f32], counts: &[usize]) -> Result<()> {
        self.mesh.all_gather_v(send, recv, counts)
    }

    fn all_reduce(&self, buf: &mut [f32]) -> Result<()> {
        self.mesh.all_reduce(buf)
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        let mut data = buf.to_vec();
        self.mesh.broadcast(&mut data, root)?;
        SyncError::check_len("library broadcast", buf.len(), data.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_key_roundtrip_and_length_check() {
        let key = RendezvousKey::generate();
        assert_eq!(RendezvousKey::from_bytes(key.as_bytes()).unwrap(), key);
        assert!(RendezvousKey::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_double_join_rejected() {
        let key = RendezvousKey::generate();
        let _a = InProcessLibrary::connect(&key, 0, 2).unwrap();
        assert!(InProcessLibrary::connect(&key, 0, 2).is_err());
        assert!(InProcessLibrary::connect(&key, 1, 3).is_err());
        let _b = InProcessLibrary::connect(&key, 1, 2).unwrap();
        assert!(!registry().lock().contains_key(&key));
    }

    #[test]
    fn test_collectives_across_handles() {
        let key = RendezvousKey::generate();
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                thread::spawn(move || {
                    let lib = InProcessLibrary::connect(&key, rank, 3).unwrap();
                    let r = rank as f32;

                    let mut sum = vec![r, 1.0];
                    lib.all_reduce(&mut sum).unwrap();

                    let mut gathered = vec![0.0; 3];
                    lib.all_gather_v(&[r], &mut gathered, &[1, 1, 1]).unwrap();

                    let mut shard = vec![0.0; 1];
                    lib.reduce_scatter(&[r, r * 2.0, r * 3.0], &mut shard).unwrap();

                    let mut root = vec![r; 2];
                    lib.broadcast(&mut root, 1).unwrap();
                    lib.barrier().unwrap();
                    (sum, gathered, shard, root)
                })
            })
            .collect();

        for (rank, h) in handles.into_iter().enumerate() {
            let (sum, gathered, shard, root) = h.join().unwrap();
            assert_eq!(sum, vec![3.0, 3.0]);
            assert_eq!(gathered, vec![0.0, 1.0, 2.0]);
            // Sum over r of r * (rank + 1) = 3 * (rank + 1).
            assert_eq!(shard, vec![3.0 * (rank as f32 + 1.0)]);
            assert_eq!(root, vec![1.0, 1.0]);
        }
    }
}
