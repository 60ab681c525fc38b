//! The authoritative parameter shards of the asynchronous trainer.
//!
//! The flattened parameter vector is split into one shard per local device.
//! Each shard lives behind its own mutex together with everything that
//! updates it: the last pushed gradient slice, the gradient-delay buffer, the
//! moving average and the shard's optimizer. Workers fetch from and push to
//! all shards, one shard lock at a time, so pushes to different shards never
//! contend.

use crate::config::TrainerConfig;
use crate::distributed::dispatch::DeviceDispatcher;
use crate::distributed::partition::{shard_ranges, ShardRange};
use crate::error::{Result, SyncError};
use crate::optim::{build_optimizer, ShardOptimizer, StateDict};
use crate::tensor::Tensor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct ShardSlot {
    params: Vec<f32>,
    grads: Vec<f32>,
    // Empty unless gradient_buffer > 1.
    buffer: Vec<f32>,
    buffer_count: usize,
    params_avg: Option<Vec<f32>>,
    optimizer: Box<dyn ShardOptimizer>,
}

impl ShardSlot {
    fn push(&mut self, grads: &[f32], gradient_buffer: usize, scale: f32, decay: Option<f32>) -> Result<()> {
        SyncError::check_len("pushed gradient shard", self.grads.len(), grads.len())?;
        self.grads.copy_from_slice(grads);

        if gradient_buffer > 1 {
            // Stays on this thread: the shard lock is held.
            self.buffer
                .iter_mut()
                .zip(&self.grads)
                .for_each(|(b, g)| *b += *g);
            self.buffer_count += 1;
            if self.buffer_count < gradient_buffer {
                return Ok(());
            }
            self.buffer_count = 0;
        }

        let ShardSlot {
            params,
            grads,
            buffer,
            params_avg,
            optimizer,
            ..
        } = self;
        let updater = if gradient_buffer > 1 { &buffer[..] } else { &grads[..] };
        optimizer.update(params, updater, scale)?;

        if gradient_buffer > 1 {
            buffer.iter_mut().for_each(|x| *x = 0.0);
        }

        if let (Some(avg), Some(decay)) = (params_avg.as_mut(), decay) {
            avg.iter_mut()
                .zip(params.iter())
                .for_each(|(a, p)| *a = (1.0 - decay) * *a + decay * *p);
        }
        Ok(())
    }
}

/// Snapshot of every shard, concatenated in shard order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShardState {
    pub params: Vec<f32>,
    pub params_avg: Option<Vec<f32>>,
    pub optimizer: StateDict,
}

/// Decay of the parameter moving average after `batches` reported batches.
///
/// Starts near 1 so the average follows the parameters closely early on and
/// settles at `min_decay`.
pub fn moving_average_decay(min_decay: f32, batches: usize) -> f32 {
    let warmup = 1.0 - (batches as f32 + 1.0) / (batches as f32 + 10.0);
    min_decay.max(warmup)
}

pub struct ShardStore {
    ranges: Vec<ShardRange>,
    slots: Vec<Mutex<ShardSlot>>,
    dispatcher: Arc<DeviceDispatcher>,
    parallel: bool,
    gradient_buffer: usize,
    scale_learning_rate: bool,
    avg_batch_words: Option<f32>,
    min_decay: Option<f32>,
    batches: AtomicUsize,
    // (sum, count) of pushed batch word counts, for the learning-rate
    // reference when no fixed one is configured.
    words_seen: Mutex<(f64, u64)>,
}

impl ShardStore {
    /// Splits `initial` into `num_shards` uniform shards.
    ///
    /// # Errors
    ///
    /// `SyncError::UnevenShards` if the parameter count does not split
    /// evenly.
    pub fn new(
        initial: &[f32],
        num_shards: usize,
        config: &TrainerConfig,
        dispatcher: Arc<DeviceDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let ranges = shard_ranges(initial.len(), num_shards)?;
        let slots = ranges
            .iter()
            .map(|range| {
                let params = initial[range.begin..range.end].to_vec();
                let buffer = if config.gradient_buffer > 1 {
                    vec![0.0; range.len()]
                } else {
                    Vec::new()
                };
                Mutex::new(ShardSlot {
                    params_avg: config.moving_average.map(|_| params.clone()),
                    grads: vec![0.0; range.len()],
                    params,
                    buffer,
                    buffer_count: 0,
                    optimizer: build_optimizer(&config.optimizer),
                })
            })
            .collect();
        debug!(
            data_size = initial.len(),
            num_shards,
            moving_average = config.moving_average.is_some(),
            "allocated parameter shards"
        );
        Ok(Self {
            ranges,
            slots,
            dispatcher,
            parallel: config.parallel_dispatch,
            gradient_buffer: config.gradient_buffer,
            scale_learning_rate: config.scale_learning_rate,
            avg_batch_words: config.avg_batch_words,
            min_decay: config.moving_average,
            batches: AtomicUsize::new(0),
            words_seen: Mutex::new((0.0, 0)),
        })
    }

    pub fn ranges(&self) -> &[ShardRange] {
        &self.ranges
    }

    pub fn data_size(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn has_moving_average(&self) -> bool {
        self.min_decay.is_some()
    }

    /// Copies the current parameters of every shard into `dest`.
    pub fn fetch_params(&self, dest: &mut Tensor) -> Result<()> {
        self.fetch(dest, false)
    }

    /// Copies the moving-average parameters into `dest`, or the current
    /// parameters when no moving average is kept.
    pub fn fetch_averaged(&self, dest: &mut Tensor) -> Result<()> {
        self.fetch(dest, true)
    }

    fn fetch(&self, dest: &mut Tensor, averaged: bool) -> Result<()> {
        SyncError::check_len("fetch destination", self.data_size(), dest.size())?;
        self.dispatcher
            .for_each_chunk_mut(dest.data_mut(), &self.ranges, self.parallel, |shard, _, chunk| {
                let slot = self.slots[shard].lock();
                let src = match (&slot.params_avg, averaged) {
                    (Some(avg), true) => avg,
                    _ => &slot.params,
                };
                chunk.copy_from_slice(src);
                Ok(())
            })
    }

    /// Pushes a full gradient vector computed over `batch_words` target
    /// words into every shard and runs the shard optimizers.
    pub fn push_gradients(&self, grads: &Tensor, batch_words: usize) -> Result<()> {
        SyncError::check_len("pushed gradients", self.data_size(), grads.size())?;
        let scale = self.learning_rate_scale(batch_words);
        let decay = self
            .min_decay
            .map(|min| moving_average_decay(min, self.batches.load(Ordering::SeqCst)));

        self.dispatcher
            .for_each_device(&self.ranges, self.parallel, |shard, range| {
                let mut slot = self.slots[shard].lock();
                slot.push(grads.subtensor(range)?, self.gradient_buffer, scale, decay)
            })
    }

    fn learning_rate_scale(&self, batch_words: usize) -> f32 {
        if !self.scale_learning_rate {
            return 1.0;
        }
        let reference = match self.avg_batch_words {
            Some(words) => words,
            None => {
                let mut seen = self.words_seen.lock();
                seen.0 += batch_words as f64;
                seen.1 += 1;
                (seen.0 / seen.1 as f64) as f32
            }
        };
        if reference > 0.0 {
            batch_words as f32 / reference
        } else {
            1.0
        }
    }

    /// Counts one reported batch; returns the new total.
    pub fn record_batch(&self) -> usize {
        self.batches.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn set_batches(&self, batches: usize) {
        self.batches.store(batches, Ordering::SeqCst);
    }

    /// Snapshot of parameters, averages and optimizer state.
    pub fn gather(&self) -> Result<ShardState> {
        let mut state = ShardState {
            params: Vec::with_capacity(self.data_size()),
            params_avg: self.min_decay.map(|_| Vec::with_capacity(self.data_size())),
            optimizer: StateDict::new(),
        };
        for (shard, slot) in self.slots.iter().enumerate() {
            let slot = slot.lock();
            state.params.extend_from_slice(&slot.params);
            if let (Some(all), Some(avg)) = (state.params_avg.as_mut(), &slot.params_avg) {
                all.extend_from_slice(avg);
            }
            let opt_state = slot.optimizer.state_dict();
            if shard > 0 && opt_state.len() != state.optimizer.len() {
                return Err(SyncError::Checkpoint(format!(
                    "shard {shard} reports {} optimizer tensors, shard 0 reported {}",
                    opt_state.len(),
                    state.optimizer.len()
                )));
            }
            for (key, values) in opt_state {
                state.optimizer.entry(key).or_default().extend(values);
            }
        }
        for (key, values) in &state.optimizer {
            if values.len() % self.slots.len() != 0 {
                return Err(SyncError::Checkpoint(format!(
                    "optimizer state '{key}' has uneven shards"
                )));
            }
        }
        Ok(state)
    }

    /// Restores a snapshot taken by [`gather`](Self::gather).
    pub fn restore(&self, state: &ShardState) -> Result<()> {
        SyncError::check_len("restored params", self.data_size(), state.params.len())?;
        if let Some(avg) = &state.params_avg {
            SyncError::check_len("restored params_avg", self.data_size(), avg.len())?;
        }
        let num_shards = self.slots.len();
        let opt_ranges = state
            .optimizer
            .iter()
            .map(|(key, values)| -> Result<_> { Ok((key, shard_ranges(values.len(), num_shards)?)) })
            .collect::<Result<Vec<_>>>()?;

        for (shard, (slot, range)) in self.slots.iter().zip(&self.ranges).enumerate() {
            let mut slot = slot.lock();
            slot.params.copy_from_slice(&state.params[range.begin..range.end]);
            match (&mut slot.params_avg, &state.params_avg) {
                (Some(dst), Some(src)) => dst.copy_from_slice(&src[range.begin..range.end]),
                (Some(dst), None) => dst.copy_from_slice(&state.params[range.begin..range.end]),
                (None, _) => {}
            }
            let shard_state: StateDict = opt_ranges
                .iter()
                .map(|(key, ranges)| {
                    let r = ranges[shard];
                    ((*key).clone(), state.optimizer[*key][r.begin..r.end].to_vec())
                })
                .collect();
            slot.optimizer.load_state_dict(&shard_state)?;
            slot.buffer.iter_mut().for_each(|x| *x = 0.0);
            slot.buffer_count = 0;
        }
        Ok(())
    }
}
