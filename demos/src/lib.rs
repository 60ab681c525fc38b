//! A toy linear-regression model used by the demo binaries.

use rand::Rng;
use shardsync::error::{Result, SyncError};
use shardsync::replica::{GraphReplica, TrainingBatch};
use shardsync::tensor::Tensor;

/// Samples `(x, y)` with `y = w* . x` for a fixed hidden `w*`.
pub struct RegressionBatch {
    pub inputs: Vec<Vec<f32>>,
    pub targets: Vec<f32>,
}

impl TrainingBatch for RegressionBatch {
    fn sentences(&self) -> usize {
        self.targets.len()
    }

    fn words(&self) -> usize {
        self.inputs.iter().map(Vec::len).sum()
    }

    fn target_words(&self) -> usize {
        self.targets.len()
    }
}

/// Draws batches for one hidden weight vector.
pub struct RegressionTask {
    pub true_weights: Vec<f32>,
}

impl RegressionTask {
    pub fn random(dim: usize) -> Self {
        let mut rng = rand::rng();
        Self {
            true_weights: (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect(),
        }
    }

    pub fn batch(&self, size: usize) -> RegressionBatch {
        let mut rng = rand::rng();
        let inputs: Vec<Vec<f32>> = (0..size)
            .map(|_| {
                (0..self.true_weights.len())
                    .map(|_| rng.random_range(-1.0..1.0))
                    .collect()
            })
            .collect();
        let targets = inputs.iter().map(|x| dot(&self.true_weights, x)).collect();
        RegressionBatch { inputs, targets }
    }

    /// Squared distance between `weights` and the hidden weights.
    pub fn distance(&self, weights: &[f32]) -> f32 {
        weights
            .iter()
            .zip(&self.true_weights)
            .map(|(w, t)| (w - t) * (w - t))
            .sum()
    }
}

/// Linear model `y = w . x` with squared-error cost.
pub struct LinearReplica {
    device: usize,
    weights: Tensor,
    grads: Tensor,
    residuals: Vec<f32>,
    inputs: Vec<Vec<f32>>,
}

impl LinearReplica {
    pub fn new(device: usize, dim: usize) -> Self {
        Self {
            device,
            weights: Tensor::zeros(dim),
            grads: Tensor::zeros(dim),
            residuals: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

impl GraphReplica for LinearReplica {
    type Batch = RegressionBatch;

    fn build(&mut self, batch: &RegressionBatch) -> Result<()> {
        if let Some(x) = batch.inputs.iter().find(|x| x.len() != self.weights.size()) {
            return Err(SyncError::Replica(format!(
                "sample of dimension {} for a model of dimension {}",
                x.len(),
                self.weights.size()
            )));
        }
        self.inputs = batch.inputs.clone();
        self.residuals = batch.targets.clone();
        Ok(())
    }

    fn forward(&mut self) -> Result<f32> {
        let weights = self.weights.data();
        for (residual, x) in self.residuals.iter_mut().zip(&self.inputs) {
            *residual = dot(weights, x) - *residual;
        }
        Ok(self.residuals.iter().map(|r| 0.5 * r * r).sum())
    }

    fn backward(&mut self) -> Result<()> {
        self.grads.fill(0.0);
        let grads = self.grads.data_mut();
        for (residual, x) in self.residuals.iter().zip(&self.inputs) {
            for (g, xi) in grads.iter_mut().zip(x) {
                *g += residual * xi;
            }
        }
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.weights
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.weights
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

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
