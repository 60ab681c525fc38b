//! Checkpoint barrier for the asynchronous workers.
//!
//! Workers run freely except around checkpoints. A worker whose progress
//! report makes a save or validation due takes *exclusive* access: it waits
//! until every other registered worker is parked at a safe point, runs the
//! checkpoint while holding the scheduling lock, then wakes everyone.
//!
//! Safe points are:
//!
//! *   [`CheckpointBarrier::step_boundary`], called between two batches,
//! *   [`CheckpointBarrier::idle`], wrapped around the blocking wait for the
//!     next batch,
//! *   waiting inside [`CheckpointBarrier::report`] for another worker's
//!     checkpoint to finish.
//!
//! The same lock also guards the observer, so progress reports are
//! serialized.

use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};

struct BarrierState<O> {
    observer: O,
    workers: usize,
    parked: usize,
    exclusive: bool,
    poisoned: bool,
}

pub struct CheckpointBarrier<O> {
    state: Mutex<BarrierState<O>>,
    cond: Condvar,
}

impl<O> CheckpointBarrier<O> {
    pub fn new(observer: O, workers: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                observer,
                workers,
                parked: 0,
                exclusive: false,
                poisoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Parks the caller while another thread holds exclusive access.
    pub fn step_boundary(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.park_while_exclusive(&mut state)
    }

    /// Runs `f` (typically a blocking receive) as a parked worker. On return
    /// the caller waits for any exclusive section in progress to finish.
    pub fn idle<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        {
            let mut state = self.state.lock();
            state.check()?;
            state.parked += 1;
            self.cond.notify_all();
        }
        let out = f();
        let mut state = self.state.lock();
        while state.exclusive && !state.poisoned {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
        state.check()?;
        Ok(out)
    }

    /// Reports progress from a registered worker.
    ///
    /// `update` runs under the scheduling lock once no exclusive section is
    /// active and returns whether a checkpoint is due. If it is, the caller
    /// waits until all other workers are parked, then runs `checkpoint`.
    pub fn report<U, C>(&self, update: U, checkpoint: C) -> Result<()>
    where
        U: FnOnce(&mut O) -> bool,
        C: FnOnce(&mut O) -> Result<()>,
    {
        let mut state = self.state.lock();
        self.park_while_exclusive(&mut state)?;
        if !update(&mut state.observer) {
            return Ok(());
        }
        self.exclusive_section(state, 1, checkpoint)
    }

    /// Runs `f` from a thread that is not a registered worker, once every
    /// worker is parked.
    pub fn quiesce<T>(&self, f: impl FnOnce(&mut O) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        while state.exclusive && !state.poisoned {
            self.cond.wait(&mut state);
        }
        state.check()?;
        self.exclusive_section(state, 0, f)
    }

    /// Removes the calling worker from the quorum.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        state.workers = state.workers.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Fails the barrier: every parked or arriving thread gets
    /// `SyncError::BarrierPoisoned` from now on.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.cond.notify_all();
    }

    /// Read access to the observer.
    pub fn with_observer<T>(&self, f: impl FnOnce(&O) -> T) -> T {
        f(&self.state.lock().observer)
    }

    pub fn into_observer(self) -> O {
        self.state.into_inner().observer
    }

    fn park_while_exclusive(&self, state: &mut MutexGuard<'_, BarrierState<O>>) -> Result<()> {
        state.check()?;
        if !state.exclusive {
            return Ok(());
        }
        state.parked += 1;
        self.cond.notify_all();
        while state.exclusive && !state.poisoned {
            self.cond.wait(state);
        }
        state.parked -= 1;
        state.check()
    }

    /// Marks exclusive access, waits until all workers except
    /// `self_workers` are parked, runs `f`, and releases.
    fn exclusive_section<T>(
        &self,
        mut state: MutexGuard<'_, BarrierState<O>>,
        self_workers: usize,
        f: impl FnOnce(&mut O) -> Result<T>,
    ) -> Result<T> {
        state.exclusive = true;
        while state.parked + self_workers < state.workers && !state.poisoned {
            self.cond.wait(&mut state);
        }
        if state.poisoned {
            state.exclusive = false;
            self.cond.notify_all();
            return Err(SyncError::BarrierPoisoned);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut state.observer)));
        state.exclusive = false;
        match outcome {
            Ok(result) => {
                self.cond.notify_all();
                result
            }
            Err(payload) => {
                state.poisoned = true;
                self.cond.notify_all();
                drop(state);
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<O> BarrierState<O> {
    fn check(&self) -> Result<()> {
        if self.poisoned {
            return Err(SyncError::BarrierPoisoned);
        }
        Ok(())
    }
}

/// Retires a worker from the barrier when dropped, including on unwind.
pub struct WorkerRegistration<'a, O> {
    barrier: &'a CheckpointBarrier<O>,
}

impl<'a, O> WorkerRegistration<'a, O> {
    pub fn new(barrier: &'a CheckpointBarrier<O>) -> Self {
        Self { barrier }
    }
}

impl<O> Drop for WorkerRegistration<'_, O> {
    fn drop(&mut self) {
        self.barrier.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_report_without_checkpoint() {
        let barrier = CheckpointBarrier::new(0usize, 1);
        barrier
            .report(
                |n| {
                    *n += 1;
                    false
                },
                |_| panic!("checkpoint must not run"),
            )
            .unwrap();
        assert_eq!(barrier.into_observer(), 1);
    }

    #[test]
    fn test_single_worker_checkpoint_runs_immediately() {
        let barrier = CheckpointBarrier::new(Vec::<&str>::new(), 1);
        barrier
            .report(|_| true, |log| {
                log.push("saved");
                Ok(())
            })
            .unwrap();
        assert_eq!(barrier.into_observer(), vec!["saved"]);
    }

    #[test]
    fn test_checkpoint_waits_for_busy_worker() {
        // Worker B is "mid-step" until it reaches its step boundary; the
        // checkpoint requested by A must not run before that.
        let barrier = Arc::new(CheckpointBarrier::new((), 2));
        let b_done = Arc::new(AtomicBool::new(false));

        let b = {
            let barrier = barrier.clone();
            let b_done = b_done.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                b_done.store(true, Ordering::SeqCst);
                barrier.step_boundary().unwrap();
                barrier.retire();
            })
        };

        let seen = AtomicBool::new(false);
        barrier
            .report(|_| true, |_| {
                seen.store(b_done.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        b.join().unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_idle_worker_counts_as_parked() {
        let barrier = Arc::new(CheckpointBarrier::new((), 2));
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let idle = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.idle(|| rx.recv()).unwrap())
        };
        // Completes while the other worker is blocked in recv.
        barrier.report(|_| true, |_| Ok(())).unwrap();
        drop(tx);
        assert!(idle.join().unwrap().is_err());
    }

    #[test]
    fn test_retire_shrinks_quorum() {
        let barrier = CheckpointBarrier::new((), 2);
        barrier.retire();
        barrier.report(|_| true, |_| Ok(())).unwrap();
    }

    #[test]
    fn test_quiesce_from_outside() {
        let barrier = Arc::new(CheckpointBarrier::new(0usize, 2));
        let stop = Arc::new(AtomicBool::new(false));
        let steps = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let (barrier, stop, steps) = (barrier.clone(), stop.clone(), steps.clone());
                thread::spawn(move || {
                    let _registration = WorkerRegistration::new(&*barrier);
                    while !stop.load(Ordering::SeqCst) {
                        steps.fetch_add(1, Ordering::SeqCst);
                        barrier.step_boundary().unwrap();
                    }
                })
            })
            .collect();

        let frozen = barrier
            .quiesce(|n| {
                *n += 1;
                let before = steps.load(Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                Ok(before == steps.load(Ordering::SeqCst))
            })
            .unwrap();
        assert!(frozen);

        stop.store(true, Ordering::SeqCst);
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(barrier.with_observer(|n| *n), 1);
    }

    #[test]
    fn test_poison_releases_waiting_checkpoint() {
        // The second worker never parks, so only poisoning ends the wait.
        let barrier = Arc::new(CheckpointBarrier::new((), 2));
        let requester = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.report(|_| true, |_| Ok(())))
        };
        thread::sleep(Duration::from_millis(20));
        barrier.poison();
        assert!(matches!(requester.join().unwrap(), Err(SyncError::BarrierPoisoned)));
        assert!(matches!(barrier.idle(|| ()), Err(SyncError::BarrierPoisoned)));
    }

    #[test]
    fn test_panic_in_checkpoint_poisons() {
        let barrier = Arc::new(CheckpointBarrier::new((), 1));
        let b = barrier.clone();
        let result = thread::spawn(move || {
            let _ = b.report(|_| true, |_| panic!("save failed"));
        })
        .join();
        assert!(result.is_err());
        assert!(matches!(barrier.step_boundary(), Err(SyncError::BarrierPoisoned)));
    }
}
