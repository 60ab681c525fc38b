//! Error types for shardsync.
//!
//! Every failure in this crate is fatal for the run that produced it. Nothing
//! here is transient: a bad shard layout, a size mismatch or a lost peer means
//! the replicas can no longer be trusted to agree, so errors propagate to the
//! top of the training loop and are never retried.

use thiserror::Error;

/// Errors that can occur while partitioning, communicating or training.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The element count does not split into equally sized shards.
    #[error(
        "uneven sharding: {data_size} elements over {num_ranks} ranks (shard size {shard_size}); \
         presently, all shards must have the same size"
    )]
    UnevenShards {
        data_size: usize,
        num_ranks: usize,
        shard_size: usize,
    },

    /// A buffer handed to a collective does not have the expected length.
    #[error("size mismatch in {context}: expected {expected}, got {got}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// Invalid configuration (zero ranks, tau of zero, out-of-range rank, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required communication substrate is not available.
    #[error("missing communication backend: {0}")]
    MissingBackend(String),

    /// A peer disconnected or a collective could not complete.
    #[error("communication error: {0}")]
    Comm(String),

    /// A thread panicked while it held exclusive checkpoint access.
    #[error("checkpoint barrier poisoned by a panicking worker")]
    BarrierPoisoned,

    /// A trainer worker thread failed.
    #[error("worker {device} failed: {message}")]
    Worker { device: usize, message: String },

    /// The graph replica reported a failure in build/forward/backward.
    #[error("replica error: {0}")]
    Replica(String),

    /// Checkpoint serialization or deserialization failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error while reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML configuration could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type alias for shardsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Shorthand for a [`SyncError::SizeMismatch`] check.
    pub(crate) fn check_len(context: &'static str, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(SyncError::SizeMismatch {
                context,
                expected,
                got,
            });
        }
        Ok(())
    }
}

impl From<safetensors::SafeTensorError> for SyncError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        SyncError::Checkpoint(format!("{:?}", e))
    }
}
