//! Collective backends over the local replicas.
//!
//! A backend owns handles to every replica of this process and implements the
//! sharded collectives on their flattened parameters and gradients. Two
//! variants exist:
//!
//! *   [`ThreadedBackend`] sums the local replicas on the dispatcher pool and
//!     exchanges one block per process through a [`ProcessGroup`].
//! *   [`LibraryBackend`] gives each local device its own
//!     [`CollectiveLibrary`] handle and lets every device take part in the
//!     collective directly.
//!
//! [`Communicator`] is the variant picked once at startup.
//!
//! Replica locks are never held while a collective is in flight: every
//! operation copies out of the replicas, communicates, then writes back.

use crate::config::BackendKind;
use crate::distributed::dispatch::DeviceDispatcher;
use crate::distributed::library::{connect_local_devices, CollectiveLibrary, LibraryProvider};
use crate::distributed::partition::{shard_range, shard_ranges, shard_size, Rank, ShardRange};
use crate::distributed::process_group::ProcessGroup;
use crate::error::{Result, SyncError};
use crate::replica::{GraphReplica, SharedReplica};
use crate::tensor::{add_into, Tensor};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives the slice of a state vector that belongs to a local device.
pub type StateSetter<'a> = dyn Fn(usize, &[f32]) -> Result<()> + Sync + 'a;

/// Produces a local device's slice of a state vector.
pub type StateGetter<'a> = dyn Fn(usize) -> Result<Vec<f32>> + Sync + 'a;

/// Sharded collectives across every rank of the run.
///
/// Every process must issue the same operations in the same order.
pub trait CollectiveBackend: Send + Sync {
    /// Total number of ranks (processes times local devices).
    fn num_ranks(&self) -> usize;

    /// Parameter ranges owned by the local devices, in local device order.
    fn local_ranges(&self) -> &[ShardRange];

    /// Sums gradients across all ranks. Afterwards each local replica holds
    /// the reduced values of its own shard and zeros everywhere else.
    fn scatter_reduce_gradients(&self) -> Result<()>;

    /// Makes every replica's parameters identical, taking each shard from its
    /// owning rank.
    fn all_gather_parameters(&self) -> Result<()>;

    /// Copies global rank 0's parameters everywhere, or with `average` set,
    /// replaces every replica's parameters by the mean across ranks.
    fn broadcast_parameters(&self, average: bool) -> Result<()>;

    /// Splits `data` into one uniform shard per rank and hands each local
    /// device its shard.
    fn scatter_state(&self, data: &[f32], set_fn: &StateSetter<'_>) -> Result<()>;

    /// Collects one shard per rank, in rank order, into the full vector on
    /// every process.
    fn gather_state(&self, get_fn: &StateGetter<'_>) -> Result<Vec<f32>>;

    /// Exchanges distributed parameter shards (one per local device, e.g. a
    /// moving average) with the replicas' parameters.
    ///
    /// Every replica on every process must hold the same parameters.
    /// Afterwards each replica holds the concatenation of all ranks' shards,
    /// and `shards[d]` holds device `d`'s slice of the old parameters, so a
    /// second call swaps back.
    fn swap_params(&self, shards: &mut [Vec<f32>]) -> Result<()>;
}

/// Rank layout shared by both variants.
#[derive(Clone, Debug)]
struct Topology {
    process_index: usize,
    num_processes: usize,
    devices_per_process: usize,
    data_size: usize,
    shard_size: usize,
    ranges: Vec<ShardRange>,
}

impl Topology {
    fn new<R: GraphReplica>(
        replicas: &[SharedReplica<R>],
        process_index: usize,
        num_processes: usize,
    ) -> Result<Self> {
        let first = replicas
            .first()
            .ok_or_else(|| SyncError::InvalidConfig("no local replicas".to_string()))?;
        let data_size = first.read().params().size();
        for replica in replicas {
            let replica = replica.read();
            SyncError::check_len("replica params", data_size, replica.params().size())?;
            SyncError::check_len("replica grads", data_size, replica.grads().size())?;
        }

        let devices_per_process = replicas.len();
        let num_ranks = num_processes * devices_per_process;
        let shard_size = shard_size(data_size, num_ranks)?;
        let ranges = (0..devices_per_process)
            .map(|local| {
                let rank = Rank::new(process_index, local, devices_per_process);
                shard_range(rank.global_rank(), data_size, num_ranks)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            process_index,
            num_processes,
            devices_per_process,
            data_size,
            shard_size,
            ranges,
        })
    }

    fn num_ranks(&self) -> usize {
        self.num_processes * self.devices_per_process
    }

    fn global_rank(&self, local: usize) -> usize {
        Rank::new(self.process_index, local, self.devices_per_process).global_rank()
    }

    /// Ranges of a state vector of `len` elements owned by the local devices.
    fn state_ranges(&self, len: usize) -> Result<Vec<ShardRange>> {
        (0..self.devices_per_process)
            .map(|local| shard_range(self.global_rank(local), len, self.num_ranks()))
            .collect()
    }
}

fn check_replica_size(tensor: &Tensor, data_size: usize, context: &'static str) -> Result<()> {
    SyncError::check_len(context, data_size, tensor.size())
}

/// Element-wise sum of one tensor of every local replica, in device order.
fn sum_local<R, F>(
    replicas: &[SharedReplica<R>],
    dispatcher: &DeviceDispatcher,
    parallel: bool,
    data_size: usize,
    pick: F,
) -> Result<Vec<f32>>
where
    R: GraphReplica,
    F: Fn(&R) -> &Tensor + Sync,
{
    for replica in replicas {
        check_replica_size(pick(&*replica.read()), data_size, "local sum input")?;
    }
    let mut sum = vec![0.0; data_size];
    let work = shard_ranges(data_size, replicas.len())?;
    dispatcher.for_each_chunk_mut(&mut sum, &work, parallel, |_, range, chunk| {
        for replica in replicas {
            let replica = replica.read();
            add_into(chunk, pick(&*replica).subtensor(range)?)?;
        }
        Ok(())
    })?;
    Ok(sum)
}

fn swap_with_replicas<B, R>(backend: &B, replicas: &[SharedReplica<R>], shards: &mut [Vec<f32>]) -> Result<()>
where
    B: CollectiveBackend + ?Sized,
    R: GraphReplica,
{
    SyncError::check_len("swapped shards", backend.local_ranges().len(), shards.len())?;
    let distributed = {
        let shards = &*shards;
        backend.gather_state(&|device| Ok(shards[device].clone()))?
    };
    let local = match replicas.first() {
        Some(replica) => replica.read().params().data().to_vec(),
        None => return Err(SyncError::InvalidConfig("no local replicas".to_string())),
    };
    SyncError::check_len("swapped params", local.len(), distributed.len())?;

    let slots: Vec<Mutex<&mut Vec<f32>>> = shards.iter_mut().map(Mutex::new).collect();
    backend.scatter_state(&local, &|device, shard| {
        let mut slot = slots[device].lock();
        SyncError::check_len("swapped shard", slot.len(), shard.len())?;
        slot.copy_from_slice(shard);
        Ok(())
    })?;
    for replica in replicas {
        replica.write().params_mut().copy_from(&distributed)?;
    }
    Ok(())
}

fn scatter_state_local(
    topology: &Topology,
    dispatcher: &DeviceDispatcher,
    parallel: bool,
    data: &[f32],
    set_fn: &StateSetter<'_>,
) -> Result<()> {
    let ranges = topology.state_ranges(data.len())?;
    dispatcher.for_each_device(&ranges, parallel, |local, range| {
        set_fn(local, &data[range.begin..range.end])
    })
}

fn collect_local_state(
    topology: &Topology,
    dispatcher: &DeviceDispatcher,
    parallel: bool,
    get_fn: &StateGetter<'_>,
) -> Result<Vec<Vec<f32>>> {
    let shards = dispatcher.map_devices(&topology.ranges, parallel, |local, _| get_fn(local))?;
    if let Some(first) = shards.first() {
        for shard in &shards {
            SyncError::check_len("gathered state shard", first.len(), shard.len())?;
        }
    }
    Ok(shards)
}

/// Collective backend that reduces locally and exchanges per-process blocks.
pub struct ThreadedBackend<R: GraphReplica> {
    replicas: Vec<SharedReplica<R>>,
    process_group: Arc<dyn ProcessGroup>,
    dispatcher: Arc<DeviceDispatcher>,
    parallel: bool,
    topology: Topology,
}

impl<R: GraphReplica> ThreadedBackend<R> {
    pub fn new(
        replicas: Vec<SharedReplica<R>>,
        process_group: Arc<dyn ProcessGroup>,
        dispatcher: Arc<DeviceDispatcher>,
        parallel: bool,
    ) -> Result<Self> {
        let topology = Topology::new(
            &replicas,
            process_group.my_rank(),
            process_group.num_processes(),
        )?;
        debug!(
            process = topology.process_index,
            ranks = topology.num_ranks(),
            shard_size = topology.shard_size,
            "threaded backend ready"
        );
        Ok(Self {
            replicas,
            process_group,
            dispatcher,
            parallel,
            topology,
        })
    }

    /// The block of the full vector this process owns.
    fn process_region(&self) -> ShardRange {
        let block = self.topology.shard_size * self.topology.devices_per_process;
        let begin = self.topology.process_index * block;
        ShardRange::new(begin, begin + block)
    }

    /// Copies every local device's shard of `pick` into one process block.
    fn collect_region<F>(&self, pick: F) -> Result<Vec<f32>>
    where
        F: Fn(&R) -> &Tensor + Sync,
    {
        let region = self.process_region();
        let mut block = vec![0.0; region.len()];
        let local: Vec<ShardRange> = self
            .topology
            .ranges
            .iter()
            .map(|r| r.relative_to(region.begin))
            .collect();
        let data_size = self.topology.data_size;
        self.dispatcher
            .for_each_chunk_mut(&mut block, &local, self.parallel, |device, _, chunk| {
                let replica = self.replicas[device].read();
                let tensor = pick(&*replica);
                check_replica_size(tensor, data_size, "process block input")?;
                chunk.copy_from_slice(tensor.subtensor(self.topology.ranges[device])?);
                Ok(())
            })?;
        Ok(block)
    }

    /// Overwrites the parameters of every local replica with `full`.
    fn write_params(&self, full: &[f32]) -> Result<()> {
        self.dispatcher
            .for_each_device(&self.topology.ranges, self.parallel, |device, _| {
                self.replicas[device].write().params_mut().copy_from(full)
            })
    }
}

impl<R: GraphReplica> CollectiveBackend for ThreadedBackend<R> {
    fn num_ranks(&self) -> usize {
        self.topology.num_ranks()
    }

    fn local_ranges(&self) -> &[ShardRange] {
        &self.topology.ranges
    }

    fn scatter_reduce_gradients(&self) -> Result<()> {
        let data_size = self.topology.data_size;
        let local_sum = sum_local(&self.replicas, &self.dispatcher, self.parallel, data_size, |r| {
            r.grads()
        })?;

        let shard = self.topology.shard_size;
        let mut reduced = vec![0.0; shard * self.topology.devices_per_process];
        self.process_group.barrier()?;
        self.process_group.reduce_scatter_block(&local_sum, &mut reduced)?;
        self.process_group.barrier()?;

        self.dispatcher
            .for_each_device(&self.topology.ranges, self.parallel, |device, range| {
                let mut replica = self.replicas[device].write();
                let grads = replica.grads_mut();
                check_replica_size(grads, data_size, "reduced gradients")?;
                grads
                    .subtensor_mut(range)?
                    .copy_from_slice(&reduced[device * shard..(device + 1) * shard]);
                grads.zero_outside(range);
                Ok(())
            })
    }

    fn all_gather_parameters(&self) -> Result<()> {
        let block = self.collect_region(|r| r.params())?;
        let mut full = vec![0.0; self.topology.data_size];
        self.process_group.all_gather(&block, &mut full)?;
        self.write_params(&full)
    }

    fn broadcast_parameters(&self, average: bool) -> Result<()> {
        let data_size = self.topology.data_size;
        let full = if average {
            let local_sum = sum_local(&self.replicas, &self.dispatcher, self.parallel, data_size, |r| {
                r.params()
            })?;
            let mut block = vec![0.0; self.process_region().len()];
            self.process_group.reduce_scatter_block(&local_sum, &mut block)?;
            let mut full = vec![0.0; data_size];
            self.process_group.all_gather(&block, &mut full)?;
            let scale = 1.0 / self.num_ranks() as f32;
            full.iter_mut().for_each(|x| *x *= scale);
            full
        } else {
            let mut full = if self.topology.process_index == 0 {
                self.replicas[0].read().params().data().to_vec()
            } else {
                Vec::new()
            };
            self.process_group.broadcast(&mut full, 0)?;
            SyncError::check_len("broadcast parameters", data_size, full.len())?;
            full
        };
        self.write_params(&full)
    }

    fn swap_params(&self, shards: &mut [Vec<f32>]) -> Result<()> {
        swap_with_replicas(self, &self.replicas, shards)
    }

    fn scatter_state(&self, data: &[f32], set_fn: &StateSetter<'_>) -> Result<()> {
        scatter_state_local(&self.topology, &self.dispatcher, self.parallel, data, set_fn)
    }

    fn gather_state(&self, get_fn: &StateGetter<'_>) -> Result<Vec<f32>> {
        let shards = collect_local_state(&self.topology, &self.dispatcher, self.parallel, get_fn)?;
        let local: Vec<f32> = shards.concat();

        let mut full = Vec::with_capacity(local.len() * self.topology.num_processes);
        for process in 0..self.topology.num_processes {
            let mut block = if process == self.topology.process_index {
                local.clone()
            } else {
                Vec::new()
            };
            self.process_group.broadcast(&mut block, process)?;
            SyncError::check_len("gathered process block", local.len(), block.len())?;
            full.extend_from_slice(&block);
        }
        Ok(full)
    }
}

/// Collective backend with one collective-library handle per local device.
///
/// Collective calls of the local devices always run concurrently on the
/// dispatcher, since each handle blocks until its peers join.
pub struct LibraryBackend<R: GraphReplica> {
    replicas: Vec<SharedReplica<R>>,
    handles: Vec<Box<dyn CollectiveLibrary>>,
    dispatcher: Arc<DeviceDispatcher>,
    parallel: bool,
    topology: Topology,
}

impl<R: GraphReplica> LibraryBackend<R> {
    /// Runs the rendezvous over `process_group` and connects one handle per
    /// local replica.
    pub fn new(
        replicas: Vec<SharedReplica<R>>,
        process_group: &dyn ProcessGroup,
        provider: &dyn LibraryProvider,
        dispatcher: Arc<DeviceDispatcher>,
        parallel: bool,
    ) -> Result<Self> {
        let topology = Topology::new(
            &replicas,
            process_group.my_rank(),
            process_group.num_processes(),
        )?;
        if dispatcher.num_devices() < topology.devices_per_process {
            return Err(SyncError::InvalidConfig(format!(
                "library backend needs one dispatcher thread per device, got {} for {}",
                dispatcher.num_devices(),
                topology.devices_per_process
            )));
        }
        let handles = connect_local_devices(provider, process_group, topology.devices_per_process)?;
        for (local, handle) in handles.iter().enumerate() {
            if handle.rank() != topology.global_rank(local) || handle.size() != topology.num_ranks() {
                return Err(SyncError::Comm(format!(
                    "library handle for device {local} is rank {} of {}, expected {} of {}",
                    handle.rank(),
                    handle.size(),
                    topology.global_rank(local),
                    topology.num_ranks()
                )));
            }
        }
        debug!(
            process = topology.process_index,
            ranks = topology.num_ranks(),
            shard_size = topology.shard_size,
            "library backend ready"
        );
        Ok(Self {
            replicas,
            handles,
            dispatcher,
            parallel,
            topology,
        })
    }

    /// Copies `pick` out of every local replica.
    fn copy_out<F>(&self, pick: F) -> Result<Vec<Vec<f32>>>
    where
        F: Fn(&R) -> &Tensor + Sync,
    {
        let data_size = self.topology.data_size;
        self.dispatcher
            .map_devices(&self.topology.ranges, self.parallel, |device, _| {
                let replica = self.replicas[device].read();
                let tensor = pick(&*replica);
                check_replica_size(tensor, data_size, "library send buffer")?;
                Ok(tensor.data().to_vec())
            })
    }

    /// Runs `f` with each local device's handle, all devices concurrently.
    fn collective<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, ShardRange, &dyn CollectiveLibrary) -> Result<T> + Sync,
    {
        self.dispatcher
            .map_devices(&self.topology.ranges, true, |device, range| {
                f(device, range, self.handles[device].as_ref())
            })
    }

    fn write_params(&self, per_device: &[Vec<f32>]) -> Result<()> {
        self.dispatcher
            .for_each_device(&self.topology.ranges, self.parallel, |device, _| {
                self.replicas[device]
                    .write()
                    .params_mut()
                    .copy_from(&per_device[device])
            })
    }
}

impl<R: GraphReplica> CollectiveBackend for LibraryBackend<R> {
    fn num_ranks(&self) -> usize {
        self.topology.num_ranks()
    }

    fn local_ranges(&self) -> &[ShardRange] {
        &self.topology.ranges
    }

    fn scatter_reduce_gradients(&self) -> Result<()> {
        let sends = self.copy_out(|r| r.grads())?;
        let shard = self.topology.shard_size;
        let reduced = self.collective(|device, _, handle| {
            let mut recv = vec![0.0; shard];
            handle.reduce_scatter(&sends[device], &mut recv)?;
            Ok(recv)
        })?;

        self.dispatcher
            .for_each_device(&self.topology.ranges, self.parallel, |device, range| {
                let mut replica = self.replicas[device].write();
                let grads = replica.grads_mut();
                grads.subtensor_mut(range)?.copy_from_slice(&reduced[device]);
                grads.zero_outside(range);
                Ok(())
            })
    }

    fn all_gather_parameters(&self) -> Result<()> {
        let params = self.copy_out(|r| r.params())?;
        let counts = vec![self.topology.shard_size; self.num_ranks()];
        let data_size = self.topology.data_size;
        let gathered = self.collective(|device, range, handle| {
            let mut recv = vec![0.0; data_size];
            handle.all_gather_v(&params[device][range.begin..range.end], &mut recv, &counts)?;
            Ok(recv)
        })?;
        self.write_params(&gathered)
    }

    fn broadcast_parameters(&self, average: bool) -> Result<()> {
        let params = self.copy_out(|r| r.params())?;
        let scale = 1.0 / self.num_ranks() as f32;
        let result = self.collective(|device, _, handle| {
            let mut buf = params[device].clone();
            if average {
                handle.all_reduce(&mut buf)?;
                buf.iter_mut().for_each(|x| *x *= scale);
            } else {
                handle.broadcast(&mut buf, 0)?;
            }
            Ok(buf)
        })?;
        self.write_params(&result)
    }

    fn swap_params(&self, shards: &mut [Vec<f32>]) -> Result<()> {
        swap_with_replicas(self, &self.replicas, shards)
    }

    fn scatter_state(&self, data: &[f32], set_fn: &StateSetter<'_>) -> Result<()> {
        scatter_state_local(&self.topology, &self.dispatcher, self.parallel, data, set_fn)
    }

    fn gather_state(&self, get_fn: &StateGetter<'_>) -> Result<Vec<f32>> {
        let shards = collect_local_state(&self.topology, &self.dispatcher, self.parallel, get_fn)?;
        let shard_len = shards.first().map_or(0, Vec::len);
        let counts = vec![shard_len; self.num_ranks()];
        let mut gathered = self.collective(|device, _, handle| {
            let mut recv = vec![0.0; shard_len * counts.len()];
            handle.all_gather_v(&shards[device], &mut recv, &counts)?;
            Ok(recv)
        })?;
        // Every device received the same vector.
        Ok(gathered.swap_remove(0))
    }
}

/// The collective backend selected for a run.
pub enum Communicator<R: GraphReplica> {
    Threaded(ThreadedBackend<R>),
    Library(LibraryBackend<R>),
}

impl<R: GraphReplica> Communicator<R> {
    /// Picks and builds the backend.
    ///
    /// `BackendKind::Auto` uses the library when `provider` is given.
    /// `BackendKind::Library` without a provider fails with
    /// `SyncError::MissingBackend`.
    pub fn select(
        kind: BackendKind,
        replicas: Vec<SharedReplica<R>>,
        process_group: Arc<dyn ProcessGroup>,
        provider: Option<&dyn LibraryProvider>,
        dispatcher: Arc<DeviceDispatcher>,
        parallel: bool,
    ) -> Result<Self> {
        let communicator = match (kind, provider) {
            (BackendKind::Library, None) => {
                return Err(SyncError::MissingBackend(
                    "library backend requested but no collective library provider is available"
                        .to_string(),
                ))
            }
            (BackendKind::Library | BackendKind::Auto, Some(provider)) => {
                Communicator::Library(LibraryBackend::new(
                    replicas,
                    process_group.as_ref(),
                    provider,
                    dispatcher,
                    parallel,
                )?)
            }
            (BackendKind::Threaded | BackendKind::Auto, _) => Communicator::Threaded(
                ThreadedBackend::new(replicas, process_group, dispatcher, parallel)?,
            ),
        };
        info!(
            backend = communicator.name(),
            ranks = communicator.num_ranks(),
            "selected collective backend"
        );
        Ok(communicator)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Communicator::Threaded(_) => "threaded",
            Communicator::Library(_) => "library",
        }
    }

    fn inner(&self) -> &dyn CollectiveBackend {
        match self {
            Communicator::Threaded(backend) => backend,
            Communicator::Library(backend) => backend,
        }
    }
}

impl<R: GraphReplica> CollectiveBackend for Communicator<R> {
    fn num_ranks(&self) -> usize {
        self.inner().num_ranks()
    }

    fn local_ranges(&self) -> &[ShardRange] {
        self.inner().local_ranges()
    }

    fn scatter_reduce_gradients(&self) -> Result<()> {
        self.inner().scatter_reduce_gradients()
    }

    fn all_gather_parameters(&self) -> Result<()> {
        self.inner().all_gather_parameters()
    }

    fn broadcast_parameters(&self, average: bool) -> Result<()> {
        self.inner().broadcast_parameters(average)
    }

    fn scatter_state(&self, data: &[f32], set_fn: &StateSetter<'_>) -> Result<()> {
        self.inner().scatter_state(data, set_fn)
    }

    fn gather_state(&self, get_fn: &StateGetter<'_>) -> Result<Vec<f32>> {
        self.inner().gather_state(get_fn)
    }

    fn swap_params(&self, shards: &mut [Vec<f32>]) -> Result<()> {
        self.inner().swap_params(shards)
    }
}
