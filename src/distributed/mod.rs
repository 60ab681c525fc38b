//! # Sharded Collectives
//!
//! Every replica holds the full flattened parameter vector, but each rank
//! *owns* one contiguous shard of it. Synchronization is two collectives:
//!
//! 1.  **Scatter-reduce**: gradients from all ranks are summed, and each rank
//!     keeps only the sum for its own shard.
//! 2.  **All-gather**: each rank contributes its shard of the parameters, and
//!     every replica ends up with the full, identical vector.
//!
//! A rank is one `(process, local device)` pair. With `P` processes of `L`
//! devices there are `R = P * L` ranks and `global = process * L + local`.
//!
//! ## Module Contents
//!
//! *   [`partition`]: shard sizes and ranges.
//! *   [`dispatch::DeviceDispatcher`]: runs one closure per local device.
//! *   [`process_group::ProcessGroup`]: point-to-point process primitive, with
//!     an in-process channel mesh for tests and demos.
//! *   [`library::CollectiveLibrary`]: a per-device collective library, with
//!     rendezvous and an in-process implementation.
//! *   [`backend::Communicator`]: the selected collective backend.

pub mod backend;
pub mod dispatch;
pub mod library;
pub mod partition;
pub mod process_group;

pub use backend::{CollectiveBackend, Communicator, LibraryBackend, ThreadedBackend};
pub use dispatch::DeviceDispatcher;
pub use library::{
    connect_local_devices, CollectiveLibrary, InProcessLibrary, InProcessProvider, LibraryProvider,
    RendezvousKey,
};
pub use partition::{shard_range, shard_ranges, shard_size, Rank, ShardRange};
pub use process_group::{ChannelProcessGroup, ProcessGroup, SingleProcess};
