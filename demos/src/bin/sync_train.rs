//! Synchronous training of a linear model over two in-process "processes"
//! with two devices each.
//!
//! Usage: `sync_train [threaded|library]`

use shardsync::config::{BackendKind, OptimizerConfig, TrainerConfig};
use shardsync::distributed::{ChannelProcessGroup, InProcessProvider, LibraryProvider, ProcessGroup};
use shardsync::logging::init_logging;
use shardsync::replica::share;
use shardsync::training::SyncTrainer;
use shardsync::{Result, SyncError};
use shardsync_demos::{LinearReplica, RegressionTask};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

const PROCESSES: usize = 2;
const DEVICES: usize = 2;
const DIM: usize = 16;
const STEPS: usize = 300;
const BATCH_SIZE: usize = 16;

fn run_process(
    group: ChannelProcessGroup,
    config: TrainerConfig,
    task: Arc<RegressionTask>,
) -> Result<f32> {
    let process = group.my_rank();
    let replicas = share((0..DEVICES).map(|d| LinearReplica::new(d, DIM)).collect());
    let provider: &dyn LibraryProvider = &InProcessProvider;
    let mut trainer = SyncTrainer::new(replicas, &config, Arc::new(group), Some(provider))?;

    for step in 0..STEPS {
        let batches = (0..DEVICES).map(|_| task.batch(BATCH_SIZE)).collect();
        let cost = trainer.step(batches)?;
        if step % 50 == 0 {
            info!(process, step, cost, "sync training");
        }
    }
    let params = trainer.gather_params()?;
    Ok(task.distance(&params))
}

fn run() -> Result<()> {
    let backend = match std::env::args().nth(1).as_deref() {
        None | Some("threaded") => BackendKind::Threaded,
        Some("library") => BackendKind::Library,
        Some(other) => {
            return Err(SyncError::InvalidConfig(format!("unknown backend '{other}'")));
        }
    };
    let config = TrainerConfig::default()
        .with_backend(backend)
        .with_optimizer(OptimizerConfig::Sgd { lr: 0.005 });
    let task = Arc::new(RegressionTask::random(DIM));

    let handles: Vec<_> = ChannelProcessGroup::create(PROCESSES)?
        .into_iter()
        .map(|group| {
            let (config, task) = (config.clone(), task.clone());
            thread::spawn(move || run_process(group, config, task))
        })
        .collect();

    for (process, handle) in handles.into_iter().enumerate() {
        let distance = handle.join().map_err(|_| SyncError::Worker {
            device: process,
            message: "process thread panicked".to_string(),
        })??;
        info!(process, distance, "distance to the true weights");
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging("info");
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sync training failed");
            ExitCode::FAILURE
        }
    }
}
