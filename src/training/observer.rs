use crate::error::Result;
use crate::replica::GraphReplica;
use tracing::info;

/// Receives training progress and decides when to save or validate.
///
/// All calls are made under the trainer's scheduling lock, so an observer
/// never sees two calls at once. `save` and `validate` only run while every
/// worker is parked, so the replicas they receive are not being trained.
pub trait TrainingObserver<R: GraphReplica>: Send {
    /// Reports the cost averaged over the reporting window, and the number
    /// of sentences and words seen since the last report.
    fn update(&mut self, avg_cost: f32, sentences: usize, words: usize);

    /// Whether a save is due after the last update.
    fn saving(&self) -> bool;

    /// Whether a validation is due after the last update.
    fn validating(&self) -> bool;

    fn save(&mut self, replica: &R) -> Result<()>;

    fn validate(&mut self, replicas: &[&R]) -> Result<()>;
}

/// Logs progress and never asks for a checkpoint.
#[derive(Debug, Default)]
pub struct ProgressLog {
    updates: usize,
    sentences: usize,
    words: usize,
    last_cost: Option<f32>,
}

impl ProgressLog {
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn sentences(&self) -> usize {
        self.sentences
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn last_cost(&self) -> Option<f32> {
        self.last_cost
    }
}

impl<R: GraphReplica> TrainingObserver<R> for ProgressLog {
    fn update(&mut self, avg_cost: f32, sentences: usize, words: usize) {
        self.updates += 1;
        self.sentences += sentences;
        self.words += words;
        self.last_cost = Some(avg_cost);
        info!(
            update = self.updates,
            cost = avg_cost,
            sentences,
            words,
            "training progress"
        );
    }

    fn saving(&self) -> bool {
        false
    }

    fn validating(&self) -> bool {
        false
    }

    fn save(&mut self, _replica: &R) -> Result<()> {
        Ok(())
    }

    fn validate(&mut self, _replicas: &[&R]) -> Result<()> {
        Ok(())
    }
}
