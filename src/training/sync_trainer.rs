//! Synchronous data-parallel training over a [`Communicator`].
//!
//! Every step runs forward/backward on all local replicas at once, sums the
//! gradients across every rank with a scatter-reduce, lets each device update
//! only the parameter shard it owns, and all-gathers the updated shards back
//! into every replica.

use crate::config::TrainerConfig;
use crate::distributed::backend::{CollectiveBackend, Communicator};
use crate::distributed::dispatch::DeviceDispatcher;
use crate::distributed::library::LibraryProvider;
use crate::distributed::process_group::ProcessGroup;
use crate::error::{Result, SyncError};
use crate::optim::{build_optimizer, ShardOptimizer};
use crate::replica::{GraphReplica, SharedReplica};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SyncTrainer<R: GraphReplica> {
    replicas: Vec<SharedReplica<R>>,
    communicator: Communicator<R>,
    dispatcher: Arc<DeviceDispatcher>,
    optimizers: Vec<Mutex<Box<dyn ShardOptimizer>>>,
    parallel: bool,
    steps: usize,
}

impl<R: GraphReplica> SyncTrainer<R> {
    /// Selects the backend, then makes every replica start from global rank
    /// 0's parameters.
    pub fn new(
        replicas: Vec<SharedReplica<R>>,
        config: &TrainerConfig,
        process_group: Arc<dyn ProcessGroup>,
        provider: Option<&dyn LibraryProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(DeviceDispatcher::new(replicas.len())?);
        let communicator = Communicator::select(
            config.backend,
            replicas.clone(),
            process_group,
            provider,
            dispatcher.clone(),
            config.parallel_dispatch,
        )?;
        let optimizers = replicas
            .iter()
            .map(|_| Mutex::new(build_optimizer(&config.optimizer)))
            .collect();

        communicator.broadcast_parameters(false)?;
        info!(
            backend = communicator.name(),
            ranks = communicator.num_ranks(),
            "sync trainer ready"
        );
        Ok(Self {
            replicas,
            communicator,
            dispatcher,
            optimizers,
            parallel: config.parallel_dispatch,
            steps: 0,
        })
    }

    pub fn communicator(&self) -> &Communicator<R> {
        &self.communicator
    }

    pub fn replicas(&self) -> &[SharedReplica<R>] {
        &self.replicas
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Runs one step with one batch per local device and returns the summed
    /// local cost.
    pub fn step(&mut self, batches: Vec<R::Batch>) -> Result<f32> {
        SyncError::check_len("batches per step", self.replicas.len(), batches.len())?;
        let ranges = self.communicator.local_ranges();
        let batches: Vec<Mutex<Option<R::Batch>>> =
            batches.into_iter().map(|b| Mutex::new(Some(b))).collect();

        let costs = self.dispatcher.map_devices(ranges, self.parallel, |device, _| {
            let batch = batches[device].lock().take().ok_or_else(|| SyncError::Worker {
                device,
                message: "batch already consumed".to_string(),
            })?;
            let mut replica = self.replicas[device].write();
            replica.build(&batch)?;
            let cost = replica.forward()?;
            replica.backward()?;
            Ok(cost)
        })?;

        self.communicator.scatter_reduce_gradients()?;

        self.dispatcher.for_each_device(ranges, self.parallel, |device, range| {
            let mut replica = self.replicas[device].write();
            let grads = replica.grads().subtensor(range)?.to_vec();
            let params = replica.params_mut().subtensor_mut(range)?;
            self.optimizers[device].lock().update(params, &grads, 1.0)
        })?;

        self.communicator.all_gather_parameters()?;

        self.steps += 1;
        let cost: f32 = costs.iter().sum();
        debug!(step = self.steps, cost, "sync step");
        Ok(cost)
    }

    /// The full parameter vector, assembled from the shard each rank owns.
    pub fn gather_params(&self) -> Result<Vec<f32>> {
        let ranges = self.communicator.local_ranges();
        self.communicator.gather_state(&|device| {
            Ok(self.replicas[device].read().params().subtensor(ranges[device])?.to_vec())
        })
    }

    /// Loads a full parameter vector: each device takes its own shard, then
    /// the shards are all-gathered into every replica.
    pub fn scatter_params(&self, params: &[f32]) -> Result<()> {
        let ranges = self.communicator.local_ranges();
        self.communicator.scatter_state(params, &|device, shard| {
            let mut replica = self.replicas[device].write();
            replica.params_mut().subtensor_mut(ranges[device])?.copy_from_slice(shard);
            Ok(())
        })?;
        self.communicator.all_gather_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, OptimizerConfig};
    use crate::distributed::process_group::SingleProcess;
    use crate::replica::{share, TrainingBatch};
    use crate::tensor::Tensor;

    struct Target(Vec<f32>);

    impl TrainingBatch for Target {
        fn sentences(&self) -> usize {
            1
        }
        fn words(&self) -> usize {
            self.0.len()
        }
        fn target_words(&self) -> usize {
            self.0.len()
        }
    }

    /// Cost 0.5 * |params - target|^2.
    struct Quadratic {
        device: usize,
        params: Tensor,
        grads: Tensor,
        target: Vec<f32>,
    }

    impl GraphReplica for Quadratic {
        type Batch = Target;

        fn build(&mut self, batch: &Target) -> Result<()> {
            SyncError::check_len("target", self.params.size(), batch.0.len())?;
            self.target = batch.0.clone();
            Ok(())
        }
        fn forward(&mut self) -> Result<f32> {
            Ok(self
                .params
                .data()
                .iter()
                .zip(&self.target)
                .map(|(p, t)| 0.5 * (p - t) * (p - t))
                .sum())
        }
        fn backward(&mut self) -> Result<()> {
            let grads: Vec<f32> = self
                .params
                .data()
                .iter()
                .zip(&self.target)
                .map(|(p, t)| p - t)
                .collect();
            self.grads.copy_from(&grads)
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

    fn trainer(devices: usize, size: usize, lr: f32) -> SyncTrainer<Quadratic> {
        let replicas = share(
            (0..devices)
                .map(|device| Quadratic {
                    device,
                    // Diverging starts; the constructor broadcasts device 0's.
                    params: Tensor::filled(size, device as f32),
                    grads: Tensor::zeros(size),
                    target: Vec::new(),
                })
                .collect(),
        );
        let config = TrainerConfig::default()
            .with_backend(BackendKind::Threaded)
            .with_optimizer(OptimizerConfig::Sgd { lr });
        SyncTrainer::new(replicas, &config, Arc::new(SingleProcess), None).unwrap()
    }

    #[test]
    fn test_replicas_start_identical() {
        let trainer = trainer(2, 4, 0.1);
        for replica in trainer.replicas() {
            assert_eq!(replica.read().params().data(), &[0.0; 4]);
        }
    }

    #[test]
    fn test_step_applies_summed_gradient() {
        let mut trainer = trainer(2, 4, 0.25);
        let cost = trainer
            .step(vec![Target(vec![1.0; 4]), Target(vec![3.0; 4])])
            .unwrap();
        assert_eq!(cost, 0.5 * 4.0 + 0.5 * 9.0 * 4.0);
        // Summed gradient is -4 everywhere; lr 0.25 moves params to 1.
        for replica in trainer.replicas() {
            assert_eq!(replica.read().params().data(), &[1.0; 4]);
        }
        assert_eq!(trainer.steps(), 1);
    }

    #[test]
    fn test_step_requires_one_batch_per_device() {
        let mut trainer = trainer(2, 4, 0.1);
        assert!(matches!(
            trainer.step(vec![Target(vec![0.0; 4])]),
            Err(SyncError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_scatter_then_gather_params() {
        let trainer = trainer(2, 4, 0.1);
        let params = vec![1.0, 2.0, 3.0, 4.0];
        trainer.scatter_params(&params).unwrap();
        assert_eq!(trainer.gather_params().unwrap(), params);
        for replica in trainer.replicas() {
            assert_eq!(replica.read().params().data(), &params[..]);
        }
    }
}
