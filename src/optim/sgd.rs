use super::{ShardOptimizer, StateDict};
use crate::error::{Result, SyncError};

/// Stochastic Gradient Descent.
///
/// `param = param - scale * learning_rate * grad`
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl ShardOptimizer for Sgd {
    fn update(&mut self, params: &mut [f32], grads: &[f32], scale: f32) -> Result<()> {
        SyncError::check_len("sgd update", params.len(), grads.len())?;
        let lr = self.learning_rate * scale;
        params
            .iter_mut()
            .zip(grads)
            .for_each(|(p, g)| *p -= lr * *g);
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) -> Result<()> {
        Ok(())
    }
}
