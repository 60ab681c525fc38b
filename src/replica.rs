//! Contracts for the model replicas being trained.
//!
//! The synchronizer never looks inside a graph. It only needs to run a
//! forward/backward pass on a batch and to read and write the replica's
//! flattened parameters and gradients.

use crate::error::Result;
use crate::tensor::Tensor;
use parking_lot::RwLock;
use std::sync::Arc;

/// A unit of training work.
pub trait TrainingBatch: Send + 'static {
    /// Number of sentences (examples) in the batch.
    fn sentences(&self) -> usize;

    /// Number of source-side words.
    fn words(&self) -> usize;

    /// Number of target-side words; drives learning-rate scaling.
    fn target_words(&self) -> usize;
}

/// One full copy of the model resident on one device.
///
/// `params()` and `grads()` are flat and always the same length, identical
/// for every replica of a run.
pub trait GraphReplica: Send + Sync + 'static {
    type Batch: TrainingBatch;

    /// Prepares the computation for `batch`.
    fn build(&mut self, batch: &Self::Batch) -> Result<()>;

    /// Runs the forward pass and returns the cost (summed over the batch).
    fn forward(&mut self) -> Result<f32>;

    /// Runs the backward pass, filling [`grads`](Self::grads).
    fn backward(&mut self) -> Result<()>;

    fn params(&self) -> &Tensor;

    fn params_mut(&mut self) -> &mut Tensor;

    fn grads(&self) -> &Tensor;

    fn grads_mut(&mut self) -> &mut Tensor;

    /// The device this replica is resident on.
    fn device_id(&self) -> usize;
}

/// A replica shared between its worker thread, the communicator and the
/// checkpoint path.
pub type SharedReplica<R> = Arc<RwLock<R>>;

/// Wraps each replica for sharing.
pub fn share<R: GraphReplica>(replicas: Vec<R>) -> Vec<SharedReplica<R>> {
    replicas.into_iter().map(|r| Arc::new(RwLock::new(r))).collect()
}
