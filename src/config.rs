//! Trainer configuration.
//!
//! Everything the synchronizer needs from the command line or a config file
//! lives in [`TrainerConfig`]. It deserializes from TOML with every field
//! optional:
//!
//! ```rust
//! use shardsync::config::{BackendKind, TrainerConfig};
//!
//! let config = TrainerConfig::from_toml_str(
//!     r#"
//!     tau = 4
//!     moving_average = 0.0001
//!     backend = "threaded"
//!
//!     [optimizer]
//!     kind = "adamw"
//!     lr = 0.0003
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.tau, 4);
//! assert_eq!(config.backend, BackendKind::Threaded);
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which collective backend to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The library backend when a library provider is available, the
    /// threaded backend otherwise.
    #[default]
    Auto,
    Threaded,
    Library,
}

/// Per-shard optimizer choice and hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Sgd {
        #[serde(default = "default_sgd_lr")]
        lr: f32,
    },
    AdamW {
        #[serde(default = "default_adam_lr")]
        lr: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
        #[serde(default)]
        weight_decay: f32,
    },
}

fn default_sgd_lr() -> f32 {
    0.01
}

fn default_adam_lr() -> f32 {
    1e-3
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::AdamW {
            lr: default_adam_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Staleness window: replicas refetch parameters and push gradients
    /// every `tau` local steps.
    pub tau: usize,
    /// Number of pushes merged into the per-shard delay buffer before the
    /// optimizer runs.
    pub gradient_buffer: usize,
    /// Scale each update by `words / avg_batch_words`.
    pub scale_learning_rate: bool,
    /// Reference batch size in target words. When unset, a running average
    /// of observed batch sizes is used.
    pub avg_batch_words: Option<f32>,
    /// Minimum decay of the parameter moving average. `None` disables it.
    pub moving_average: Option<f32>,
    /// Run per-device work on the dispatcher pool instead of the caller's
    /// thread.
    pub parallel_dispatch: bool,
    pub backend: BackendKind,
    // Kept last: TOML tables must follow plain values.
    pub optimizer: OptimizerConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            tau: 1,
            gradient_buffer: 1,
            scale_learning_rate: false,
            avg_batch_words: None,
            moving_average: None,
            parallel_dispatch: true,
            backend: BackendKind::Auto,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: TrainerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }

    pub fn with_tau(mut self, tau: usize) -> Self {
        self.tau = tau;
        self
    }

    pub fn with_gradient_buffer(mut self, gradient_buffer: usize) -> Self {
        self.gradient_buffer = gradient_buffer;
        self
    }

    pub fn with_scale_learning_rate(mut self, avg_batch_words: Option<f32>) -> Self {
        self.scale_learning_rate = true;
        self.avg_batch_words = avg_batch_words;
        self
    }

    pub fn with_moving_average(mut self, min_decay: f32) -> Self {
        self.moving_average = Some(min_decay);
        self
    }

    pub fn with_parallel_dispatch(mut self, parallel: bool) -> Self {
        self.parallel_dispatch = parallel;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Rejects settings the trainer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tau == 0 {
            return Err(SyncError::InvalidConfig("tau must be at least 1".to_string()));
        }
        if self.gradient_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "gradient_buffer must be at least 1".to_string(),
            ));
        }
        if let Some(decay) = self.moving_average {
            if !(decay > 0.0 && decay <= 1.0) {
                return Err(SyncError::InvalidConfig(format!(
                    "moving_average decay must be in (0, 1], got {decay}"
                )));
            }
        }
        if let Some(words) = self.avg_batch_words {
            if !(words > 0.0) {
                return Err(SyncError::InvalidConfig(format!(
                    "avg_batch_words must be positive, got {words}"
                )));
            }
        }
        Ok(())
    }

    /// Steps between two progress reports.
    pub fn report_interval(&self) -> usize {
        self.tau * self.gradient_buffer
    }
}
