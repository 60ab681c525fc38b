//! Asynchronous multi-device training.
//!
//! Every local device gets one long-lived worker thread bound to one
//! replica. Batches go into a shared queue and whichever worker is idle
//! takes the next one. Workers never synchronize with each other for
//! training: each one fetches the authoritative shards every `tau` local
//! steps, accumulates gradients in between, and pushes them shard by shard.
//! The only global coordination is the [`CheckpointBarrier`] around saves and
//! validations.

use crate::checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};
use crate::config::TrainerConfig;
use crate::distributed::dispatch::DeviceDispatcher;
use crate::distributed::partition::shard_size;
use crate::error::{Result, SyncError};
use crate::replica::{GraphReplica, SharedReplica, TrainingBatch};
use crate::tensor::Tensor;
use crate::training::barrier::{CheckpointBarrier, WorkerRegistration};
use crate::training::observer::TrainingObserver;
use crate::training::shards::{ShardState, ShardStore};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

struct Shared<R: GraphReplica, O> {
    config: TrainerConfig,
    replicas: Vec<SharedReplica<R>>,
    dispatcher: Arc<DeviceDispatcher>,
    store: OnceLock<ShardStore>,
    barrier: CheckpointBarrier<O>,
    // Device and message of the first worker failure.
    failure: Mutex<Option<(usize, String)>>,
}

impl<R, O> Shared<R, O>
where
    R: GraphReplica,
    O: TrainingObserver<R>,
{
    fn store(&self) -> Result<&ShardStore> {
        self.store
            .get()
            .ok_or_else(|| SyncError::InvalidConfig("parameter shards are not allocated yet".to_string()))
    }

    fn init_store(&self, initial: &[f32]) -> Result<&ShardStore> {
        if self.store.get().is_none() {
            let store = ShardStore::new(
                initial,
                self.replicas.len(),
                &self.config,
                self.dispatcher.clone(),
            )?;
            // Only the producer thread initializes, so the slot is still empty.
            let _ = self.store.set(store);
        }
        self.store()
    }

    /// Stops the run: parked and arriving workers get
    /// `SyncError::BarrierPoisoned`, and `execute` reports the failure.
    fn fail(&self, device: usize, error: &SyncError) {
        self.barrier.poison();
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some((device, error.to_string()));
        }
    }

    /// Runs with every other worker parked: syncs the moving average into
    /// the replicas, then saves and validates as the observer asks.
    fn checkpoint(&self, observer: &mut O, device: usize) -> Result<()> {
        let store = self.store()?;
        if store.has_moving_average() {
            for replica in &self.replicas {
                store.fetch_averaged(replica.write().params_mut())?;
            }
        }

        if observer.saving() {
            info!(device, batches = store.batches(), "saving model");
            observer.save(&self.replicas[device].read())?;
        }
        if observer.validating() {
            info!(device, batches = store.batches(), "validating model");
            let guards: Vec<_> = self.replicas.iter().map(|r| r.read()).collect();
            let replicas: Vec<&R> = guards.iter().map(|g| &**g).collect();
            observer.validate(&replicas)?;
        }
        Ok(())
    }
}

/// Per-worker loop state.
struct WorkerState {
    device: usize,
    t: usize,
    seen_words: usize,
    cost: f32,
    sentences: usize,
    words: usize,
    // Only kept when tau > 1.
    accumulator: Option<Tensor>,
}

impl WorkerState {
    fn new(device: usize, data_size: usize, tau: usize) -> Self {
        Self {
            device,
            t: 0,
            seen_words: 0,
            cost: 0.0,
            sentences: 0,
            words: 0,
            accumulator: (tau > 1).then(|| Tensor::zeros(data_size)),
        }
    }

    fn step<R, O>(&mut self, shared: &Shared<R, O>, batch: &R::Batch) -> Result<()>
    where
        R: GraphReplica,
        O: TrainingObserver<R>,
    {
        let store = shared.store()?;
        let tau = shared.config.tau;
        {
            let mut replica = shared.replicas[self.device].write();
            replica.build(batch)?;
            if self.t % tau == 0 {
                store.fetch_params(replica.params_mut())?;
            }
            self.cost += replica.forward()?;
            replica.backward()?;

            let batch_words = batch.target_words();
            self.words += batch.words();
            self.sentences += batch.sentences();

            match self.accumulator.as_mut() {
                Some(acc) => {
                    acc.add_assign(replica.grads().data())?;
                    self.seen_words += batch_words;
                }
                None => self.seen_words = batch_words,
            }

            self.t += 1;

            if self.t % tau == 0 {
                match self.accumulator.as_mut() {
                    Some(acc) => {
                        store.push_gradients(acc, self.seen_words)?;
                        acc.fill(0.0);
                    }
                    None => store.push_gradients(replica.grads(), self.seen_words)?,
                }
                self.seen_words = 0;
            }
        }

        if self.t % shared.config.report_interval() == 0 {
            self.report(shared)?;
        }
        Ok(())
    }

    fn report<R, O>(&mut self, shared: &Shared<R, O>) -> Result<()>
    where
        R: GraphReplica,
        O: TrainingObserver<R>,
    {
        let store = shared.store()?;
        let avg_cost = self.cost / shared.config.report_interval() as f32;
        let (sentences, words) = (self.sentences, self.words);
        self.cost = 0.0;
        self.sentences = 0;
        self.words = 0;

        let device = self.device;
        shared.barrier.report(
            |observer| {
                observer.update(avg_cost, sentences, words);
                store.record_batch();
                observer.saving() || observer.validating()
            },
            |observer| shared.checkpoint(observer, device),
        )
    }
}

fn run_worker<R, O>(shared: &Shared<R, O>, device: usize, batches: Receiver<R::Batch>) -> Result<()>
where
    R: GraphReplica,
    O: TrainingObserver<R>,
{
    let _registration = WorkerRegistration::new(&shared.barrier);
    let data_size = shared.replicas[device].read().params().size();
    let mut state = WorkerState::new(device, data_size, shared.config.tau);
    debug!(device, "worker started");

    loop {
        let batch = match shared.barrier.idle(|| batches.recv())? {
            Ok(batch) => batch,
            Err(_) => break,
        };
        state.step(shared, &batch)?;
        shared.barrier.step_boundary()?;
    }

    debug!(device, steps = state.t, "worker stopped");
    Ok(())
}

/// The asynchronous trainer.
///
/// # Example
///
/// ```rust,ignore
/// let mut trainer = AsyncTrainer::new(share(replicas), config, ProgressLog::default())?;
/// for batch in batches {
///     trainer.execute(batch)?;
/// }
/// trainer.finish()?;
/// ```
pub struct AsyncTrainer<R: GraphReplica, O: TrainingObserver<R> + 'static> {
    shared: Arc<Shared<R, O>>,
    sender: Option<Sender<R::Batch>>,
    // workers[i] is bound to replicas[i].
    workers: Vec<(usize, JoinHandle<Result<()>>)>,
}

impl<R, O> AsyncTrainer<R, O>
where
    R: GraphReplica,
    O: TrainingObserver<R> + 'static,
{
    /// Starts one worker per replica.
    ///
    /// # Errors
    ///
    /// * `SyncError::InvalidConfig` for an invalid config or no replicas.
    /// * `SyncError::SizeMismatch` if the replicas differ in size.
    /// * `SyncError::UnevenShards` if the parameters do not split evenly
    ///   over the replicas.
    pub fn new(replicas: Vec<SharedReplica<R>>, config: TrainerConfig, observer: O) -> Result<Self> {
        config.validate()?;
        let first = replicas
            .first()
            .ok_or_else(|| SyncError::InvalidConfig("async trainer needs at least one replica".to_string()))?;
        let data_size = first.read().params().size();
        for replica in &replicas {
            let replica = replica.read();
            SyncError::check_len("replica params", data_size, replica.params().size())?;
            SyncError::check_len("replica grads", data_size, replica.grads().size())?;
        }
        shard_size(data_size, replicas.len())?;

        let dispatcher = Arc::new(DeviceDispatcher::new(replicas.len())?);
        let num_workers = replicas.len();
        let shared = Arc::new(Shared {
            config,
            replicas,
            dispatcher,
            store: OnceLock::new(),
            barrier: CheckpointBarrier::new(observer, num_workers),
            failure: Mutex::new(None),
        });

        let (sender, receiver) = unbounded();
        let workers = (0..num_workers)
            .map(|device| {
                let shared = shared.clone();
                let receiver = receiver.clone();
                let handle = thread::Builder::new()
                    .name(format!("shardsync-worker-{device}"))
                    .spawn(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_worker(&*shared, device, receiver)
                        }))
                        .unwrap_or_else(|panic| {
                            Err(SyncError::Worker {
                                device,
                                message: panic_message(panic.as_ref()),
                            })
                        });
                        match &result {
                            // Stopped by another worker's failure.
                            Err(SyncError::BarrierPoisoned) => {
                                debug!(device, "worker stopped by a failed run")
                            }
                            Err(e) => {
                                error!(device, error = %e, "worker failed");
                                shared.fail(device, e);
                            }
                            Ok(()) => {}
                        }
                        result
                    })?;
                Ok((device, handle))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            workers = num_workers,
            data_size,
            tau = shared.config.tau,
            gradient_buffer = shared.config.gradient_buffer,
            "async trainer started"
        );
        Ok(Self {
            shared,
            sender: Some(sender),
            workers,
        })
    }

    /// Queues `batch` for the next idle worker. The first call allocates the
    /// parameter shards from the first replica's parameters.
    ///
    /// # Errors
    ///
    /// `SyncError::Worker` once any worker has failed. The run is over at
    /// that point; [`finish`](Self::finish) returns the original error.
    pub fn execute(&mut self, batch: R::Batch) -> Result<()> {
        if let Some((device, message)) = self.shared.failure.lock().clone() {
            return Err(SyncError::Worker { device, message });
        }
        if self.shared.store.get().is_none() {
            let initial = self.shared.replicas[0].read().params().data().to_vec();
            self.shared.init_store(&initial)?;
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SyncError::InvalidConfig("trainer already finished".to_string()))?;
        sender
            .send(batch)
            .map_err(|_| SyncError::Comm("all trainer workers have stopped".to_string()))
    }

    /// Blocks until every worker is parked at a safe point, then releases
    /// them.
    pub fn wait(&self) -> Result<()> {
        self.shared.barrier.quiesce(|_| Ok(()))
    }

    /// Closes the queue, lets the workers drain it and joins them.
    ///
    /// Returns the error of the worker that failed first. Workers stopped by
    /// that failure only report `SyncError::BarrierPoisoned`.
    pub fn finish(&mut self) -> Result<()> {
        self.sender = None;
        let mut errors: Vec<(usize, SyncError)> = Vec::new();
        for (device, handle) in self.workers.drain(..) {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(panic) => Err(SyncError::Worker {
                    device,
                    message: panic_message(panic.as_ref()),
                }),
            };
            if let Err(e) = outcome {
                errors.push((device, e));
            }
        }
        if errors.is_empty() {
            info!("async trainer finished");
            return Ok(());
        }
        let root = self.shared.failure.lock().as_ref().map(|(device, _)| *device);
        let index = root
            .and_then(|root| errors.iter().position(|(device, _)| *device == root))
            .unwrap_or(0);
        Err(errors.swap_remove(index).1)
    }

    /// Runs `f` on the observer under the scheduling lock.
    pub fn with_observer<T>(&self, f: impl FnOnce(&O) -> T) -> T {
        self.shared.barrier.with_observer(f)
    }

    pub fn replicas(&self) -> &[SharedReplica<R>] {
        &self.shared.replicas
    }

    /// Number of progress reports so far.
    pub fn batches(&self) -> usize {
        self.shared.store.get().map_or(0, ShardStore::batches)
    }

    /// Snapshot of the shards, taken while all workers are parked.
    pub fn gather_state(&self) -> Result<ShardState> {
        self.shared.barrier.quiesce(|_| self.shared.store()?.gather())
    }

    /// Writes the shard snapshot to a safetensors file.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = self.shared.barrier.quiesce(|_| {
            let store = self.shared.store()?;
            Ok(Checkpoint::from_shard_state(store.gather()?, store.batches() as u64))
        })?;
        save_checkpoint(path.as_ref(), &checkpoint)?;
        info!(path = %path.as_ref().display(), "saved trainer checkpoint");
        Ok(())
    }

    /// Restores shards, averages, optimizer state and the batch counter from
    /// a file written by [`save_checkpoint`](Self::save_checkpoint), and
    /// loads the restored parameters into every replica.
    pub fn restore_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let (state, batches) = load_checkpoint(path.as_ref())?.into_shard_state()?;
        let shared = &self.shared;
        shared.barrier.quiesce(|_| {
            let store = shared.init_store(&state.params)?;
            store.restore(&state)?;
            store.set_batches(batches as usize);
            for replica in &shared.replicas {
                store.fetch_params(replica.write().params_mut())?;
            }
            Ok(())
        })?;
        info!(path = %path.as_ref().display(), batches, "restored trainer checkpoint");
        Ok(())
    }
}

impl<R, O> Drop for AsyncTrainer<R, O>
where
    R: GraphReplica,
    O: TrainingObserver<R> + 'static,
{
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.finish() {
                error!(error = %e, "async trainer dropped with a failed worker");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::replica::share;
    use crate::training::observer::ProgressLog;
    use std::time::{Duration, Instant};

    struct Batch(f32);

    impl TrainingBatch for Batch {
        fn sentences(&self) -> usize {
            1
        }
        fn words(&self) -> usize {
            2
        }
        fn target_words(&self) -> usize {
            2
        }
    }

    /// Gradient of every element is the batch value. A NaN batch fails the
    /// build and an infinite one panics.
    struct Constant {
        device: usize,
        params: Tensor,
        grads: Tensor,
        pending: f32,
    }

    impl GraphReplica for Constant {
        type Batch = Batch;

        fn build(&mut self, batch: &Batch) -> Result<()> {
            if batch.0.is_nan() {
                return Err(SyncError::Replica(format!("device {} got a NaN batch", self.device)));
            }
            if batch.0.is_infinite() {
                panic!("infinite batch");
            }
            self.pending = batch.0;
            Ok(())
        }
        fn forward(&mut self) -> Result<f32> {
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

    fn replicas(n: usize, size: usize) -> Vec<SharedReplica<Constant>> {
        share(
            (0..n)
                .map(|device| Constant {
                    device,
                    params: Tensor::zeros(size),
                    grads: Tensor::zeros(size),
                    pending: 0.0,
                })
                .collect(),
        )
    }

    fn sgd() -> TrainerConfig {
        TrainerConfig::default().with_optimizer(OptimizerConfig::Sgd { lr: 1.0 })
    }

    #[test]
    fn test_every_gradient_applied_once() {
        let mut trainer = AsyncTrainer::new(replicas(2, 4), sgd(), ProgressLog::default()).unwrap();
        for _ in 0..10 {
            trainer.execute(Batch(1.0)).unwrap();
        }
        trainer.finish().unwrap();

        let state = trainer.gather_state().unwrap();
        assert_eq!(state.params, vec![-10.0; 4]);
        trainer.with_observer(|log| {
            assert_eq!(log.updates(), 10);
            assert_eq!(log.sentences(), 10);
        });
        assert_eq!(trainer.batches(), 10);
    }

    #[test]
    fn test_tau_accumulates() {
        // One worker, tau = 2: one push of the two accumulated gradients.
        let config = sgd().with_tau(2);
        let mut trainer = AsyncTrainer::new(replicas(1, 2), config, ProgressLog::default()).unwrap();
        trainer.execute(Batch(1.0)).unwrap();
        trainer.execute(Batch(2.0)).unwrap();
        trainer.finish().unwrap();
        assert_eq!(trainer.gather_state().unwrap().params, vec![-3.0, -3.0]);
        trainer.with_observer(|log| {
            assert_eq!(log.updates(), 1);
            assert_eq!(log.last_cost(), Some(1.5));
        });
    }

    #[test]
    fn test_uneven_rejected_at_start() {
        let result = AsyncTrainer::new(replicas(3, 10), sgd(), ProgressLog::default());
        assert!(matches!(result, Err(SyncError::UnevenShards { .. })));
    }

    #[test]
    fn test_execute_after_finish_fails() {
        let mut trainer = AsyncTrainer::new(replicas(1, 2), sgd(), ProgressLog::default()).unwrap();
        trainer.finish().unwrap();
        assert!(trainer.execute(Batch(1.0)).is_err());
    }

    /// Keeps queueing good batches until `execute` reports the failure.
    fn execute_until_error(trainer: &mut AsyncTrainer<Constant, ProgressLog>) -> SyncError {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match trainer.execute(Batch(1.0)) {
                Err(e) => return e,
                Ok(()) => {
                    assert!(Instant::now() < deadline, "worker failure never surfaced");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    #[test]
    fn test_worker_error_stops_the_run() {
        let mut trainer = AsyncTrainer::new(replicas(2, 4), sgd(), ProgressLog::default()).unwrap();
        trainer.execute(Batch(f32::NAN)).unwrap();

        let err = execute_until_error(&mut trainer);
        assert!(matches!(err, SyncError::Worker { .. }), "{err}");
        assert!(err.to_string().contains("NaN batch"));

        // No worker reports progress once the failure is visible.
        let updates = trainer.with_observer(|log| log.updates());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(trainer.with_observer(|log| log.updates()), updates);

        assert!(matches!(trainer.finish(), Err(SyncError::Replica(_))));
    }

    #[test]
    fn test_worker_panic_stops_the_run() {
        let mut trainer = AsyncTrainer::new(replicas(2, 4), sgd(), ProgressLog::default()).unwrap();
        trainer.execute(Batch(f32::INFINITY)).unwrap();

        let err = execute_until_error(&mut trainer);
        assert!(err.to_string().contains("infinite batch"), "{err}");
        match trainer.finish() {
            Err(SyncError::Worker { message, .. }) => assert_eq!(message, "infinite batch"),
            other => panic!("unexpected finish result: {other:?}"),
        }
    }
}
