//! Per-shard optimizers.
//!
//! Each local device owns one parameter shard and one optimizer instance for
//! it. The optimizer only ever sees its own contiguous slice of the flattened
//! parameter vector, so its state (moments, step counters) is sharded the
//! same way as the parameters.

pub mod adamw;
pub mod sgd;

pub use adamw::AdamW;
pub use sgd::Sgd;

use crate::config::OptimizerConfig;
use crate::error::Result;
use std::collections::BTreeMap;

/// Named state vectors of one shard's optimizer.
///
/// For a given optimizer type every shard reports the same keys with the same
/// lengths, so the vectors of all shards can be concatenated per key.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// An optimizer that updates one parameter shard in place.
///
/// Updates run on the calling thread. The shard store calls them while it
/// holds the shard lock on a dispatcher thread, so an update must not hand
/// work to rayon.
pub trait ShardOptimizer: Send {
    /// Applies one update. `scale` multiplies the learning rate for this
    /// step only.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::SizeMismatch` if `params` and `grads` differ in
    /// length, or if they do not match the size of existing state.
    fn update(&mut self, params: &mut [f32], grads: &[f32], scale: f32) -> Result<()>;

    /// Snapshot of the optimizer state.
    fn state_dict(&self) -> StateDict;

    /// Replaces the optimizer state. Keys not produced by
    /// [`state_dict`](Self::state_dict) are ignored.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// Builds a fresh optimizer from its configuration.
pub fn build_optimizer(config: &OptimizerConfig) -> Box<dyn ShardOptimizer> {
    match *config {
        OptimizerConfig::Sgd { lr } => Box::new(Sgd::new(lr)),
        OptimizerConfig::AdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } => Box::new(
            AdamW::new(lr)
                .with_betas(beta1, beta2)
                .with_epsilon(eps)
                .with_weight_decay(weight_decay),
        ),
    }
}
