//! Training drivers built on the shard store and the communicator.
//!
//! - [`async_trainer`]: one free-running worker per device with stale
//!   parameter fetches and per-shard pushes.
//! - [`sync_trainer`]: lock-step data parallelism over a
//!   [`Communicator`](crate::distributed::Communicator).

pub mod async_trainer;
pub mod barrier;
pub mod observer;
pub mod shards;
pub mod sync_trainer;

pub use async_trainer::AsyncTrainer;
pub use barrier::{CheckpointBarrier, WorkerRegistration};
pub use observer::{ProgressLog, TrainingObserver};
pub use shards::{moving_average_decay, ShardState, ShardStore};
pub use sync_trainer::SyncTrainer;
