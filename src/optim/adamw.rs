use super::{ShardOptimizer, StateDict};
use crate::error::{Result, SyncError};

/// AdamW optimizer.
///
/// Adam with decoupled weight decay, see
/// [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - s \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// where $s$ is the per-step learning-rate scale.
pub struct AdamW {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    // Allocated on the first update, sized to the shard.
    m: Vec<f32>,
    v: Vec<f32>,
    step: u64,
}

impl AdamW {
    /// Creates an AdamW optimizer with betas (0.9, 0.999), epsilon 1e-8 and
    /// no weight decay.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            step: 0,
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

impl ShardOptimizer for AdamW {
    fn update(&mut self, params: &mut [f32], grads: &[f32], scale: f32) -> Result<()> {
        SyncError::check_len("adamw update", params.len(), grads.len())?;
        if self.m.is_empty() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }
        SyncError::check_len("adamw state", self.m.len(), params.len())?;

        self.step += 1;
        let lr = self.learning_rate * scale;
        let (b1, b2, eps, lambda) = (self.beta1, self.beta2, self.epsilon, self.weight_decay);
        let bias_correction1 = 1.0 - b1.powi(self.step as i32);
        let bias_correction2 = 1.0 - b2.powi(self.step as i32);

        params
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
            .for_each(|(((p, g), m), v)| {
                *m = b1 * *m + (1.0 - b1) * *g;
                *v = b2 * *v + (1.0 - b2) * *g * *g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            });

        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("adam_m".to_string(), self.m.clone());
        state.insert("adam_v".to_string(), self.v.clone());
        state.insert("adam_step".to_string(), vec![self.step as f32]);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let get = |key: &str| {
            state
                .get(key)
                .ok_or_else(|| SyncError::Checkpoint(format!("missing optimizer state '{key}'")))
        };
        let m = get("adam_m")?;
        let v = get("adam_v")?;
        SyncError::check_len("adamw state load", m.len(), v.len())?;
        let step = get("adam_step")?;
        SyncError::check_len("adamw step", 1, step.len())?;

        self.m = m.clone();
        self.v = v.clone();
        self.step = step[0] as u64;
        Ok(())
    }
}
