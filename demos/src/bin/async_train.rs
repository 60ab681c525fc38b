//! Asynchronous training of a linear model on four simulated devices.
//!
//! Usage: `async_train [config.toml] [checkpoint.safetensors]`

use shardsync::config::{OptimizerConfig, TrainerConfig};
use shardsync::logging::init_logging;
use shardsync::replica::share;
use shardsync::training::{AsyncTrainer, ProgressLog};
use shardsync::Result;
use shardsync_demos::{LinearReplica, RegressionTask};
use std::process::ExitCode;
use tracing::{error, info};

const DEVICES: usize = 4;
const DIM: usize = 16;
const BATCHES: usize = 2000;
const BATCH_SIZE: usize = 32;

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => TrainerConfig::from_path(path)?,
        None => TrainerConfig::default()
            .with_tau(2)
            .with_moving_average(1e-3)
            .with_optimizer(OptimizerConfig::Sgd { lr: 0.002 }),
    };
    let checkpoint = args.next();

    let task = RegressionTask::random(DIM);
    let replicas = share((0..DEVICES).map(|d| LinearReplica::new(d, DIM)).collect());
    let mut trainer = AsyncTrainer::new(replicas, config, ProgressLog::default())?;

    for _ in 0..BATCHES {
        trainer.execute(task.batch(BATCH_SIZE))?;
    }
    trainer.finish()?;

    let state = trainer.gather_state()?;
    info!(distance = task.distance(&state.params), "distance to the true weights");
    if let Some(avg) = &state.params_avg {
        info!(distance = task.distance(avg), "distance of the moving average");
    }
    trainer.with_observer(|log| info!(updates = log.updates(), words = log.words(), "done"));

    if let Some(path) = checkpoint {
        trainer.save_checkpoint(&path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging("info");
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "async training failed");
            ExitCode::FAILURE
        }
    }
}
