#![allow(dead_code)]

use shardsync::error::Result;
use shardsync::replica::{share, GraphReplica, SharedReplica, TrainingBatch};
use shardsync::tensor::Tensor;

/// A batch whose gradient is `value` in every element.
pub struct ConstBatch {
    pub value: f32,
    pub words: usize,
}

impl ConstBatch {
    pub fn new(value: f32) -> Self {
        Self { value, words: 4 }
    }
}

impl TrainingBatch for ConstBatch {
    fn sentences(&self) -> usize {
        1
    }

    fn words(&self) -> usize {
        self.words
    }

    fn target_words(&self) -> usize {
        self.words
    }
}

/// Replica with externally set gradients.
///
/// `backward` fills the gradient with the batch value. Every forward pass
/// logs the value of the first parameter it ran against.
pub struct VecReplica {
    pub device: usize,
    pub params: Tensor,
    pub grads: Tensor,
    pub pending: f32,
    pub seen: Vec<f32>,
}

impl VecReplica {
    pub fn new(device: usize, params: Vec<f32>, grads: Vec<f32>) -> Self {
        Self {
            device,
            params: Tensor::new(params),
            grads: Tensor::new(grads),
            pending: 0.0,
            seen: Vec::new(),
        }
    }
}

impl GraphReplica for VecReplica {
    type Batch = ConstBatch;

    fn build(&mut self, batch: &ConstBatch) -> Result<()> {
        self.pending = batch.value;
        Ok(())
    }

    fn forward(&mut self) -> Result<f32> {
        self.seen.push(self.params.data()[0]);
        Ok(self.pending)
    }

    fn backward(&mut self) -> Result<()> {
        self.grads.fill(self.pending);
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn grads(&self) -> &Tensor {
        &self.grads
    }

    fn grads_mut(&mut self) -> &mut Tensor {
        &mut self.grads
    }

    fn device_id(&self) -> usize {
        self.device
    }
}

/// `devices` replicas of `size` zero parameters and zero gradients.
pub fn zero_replicas(devices: usize, size: usize) -> Vec<SharedReplica<VecReplica>> {
    share(
        (0..devices)
            .map(|d| VecReplica::new(d, vec![0.0; size], vec![0.0; size]))
            .collect(),
    )
}
