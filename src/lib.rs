//! # shardsync
//!
//! `shardsync` is the synchronization layer of a replicated-model trainer:
//! it keeps `R = processes * devices` copies of a model in agreement while
//! they train on different batches.
//!
//! The model itself stays outside the crate. A replica only has to expose
//! its flattened parameters and gradients through [`replica::GraphReplica`].
//!
//! ## Modules
//!
//! - [`distributed`]: shard partitioning, the device dispatcher, process
//!   groups, collective libraries and the two collective backends.
//! - [`training`]: the shard store, checkpoint barrier and the asynchronous
//!   and synchronous trainers.
//! - [`optim`]: per-shard optimizers.
//! - [`checkpoint`]: safetensors persistence of trainer state.
//! - [`config`]: TOML-loadable trainer configuration.
//!
//! ## Example
//!
//! ```rust
//! use shardsync::distributed::shard_ranges;
//!
//! let ranges = shard_ranges(400, 4).unwrap();
//! assert_eq!(ranges[1].begin, 100);
//! assert!(shard_ranges(10, 3).is_err());
//! ```

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod optim;
pub mod replica;
pub mod tensor;
pub mod training;

pub use config::{BackendKind, OptimizerConfig, TrainerConfig};
pub use error::{Result, SyncError};
pub use replica::{share, GraphReplica, SharedReplica, TrainingBatch};
pub use tensor::Tensor;
