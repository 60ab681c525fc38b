use shardsync::training::{CheckpointBarrier, WorkerRegistration};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const CHECKPOINT_STEP: usize = 10;
const LAST_STEP: usize = 11;

/// Records the step counters of the other workers when the save runs.
#[derive(Default)]
struct SaveLog {
    saves: usize,
    others_at_save: Vec<usize>,
}

#[test]
fn test_three_workers_park_before_save() {
    let barrier = Arc::new(CheckpointBarrier::new(SaveLog::default(), 3));
    let steps: Arc<Vec<AtomicUsize>> = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
    let reached_checkpoint_step = Arc::new(Barrier::new(3));

    let followers: Vec<_> = [1usize, 2]
        .into_iter()
        .map(|me| {
            let (barrier, steps, sync) = (barrier.clone(), steps.clone(), reached_checkpoint_step.clone());
            thread::spawn(move || {
                let _registration = WorkerRegistration::new(&*barrier);
                for step in 1..=LAST_STEP {
                    steps[me].store(step, Ordering::SeqCst);
                    if step == CHECKPOINT_STEP {
                        sync.wait();
                        // Give the leader time to request exclusive access.
                        thread::sleep(Duration::from_millis(50));
                    }
                    barrier.step_boundary().unwrap();
                }
            })
        })
        .collect();

    {
        let _registration = WorkerRegistration::new(&*barrier);
        for step in 1..=LAST_STEP {
            steps[0].store(step, Ordering::SeqCst);
            if step == CHECKPOINT_STEP {
                reached_checkpoint_step.wait();
                barrier
                    .report(
                        |_| true,
                        |log| {
                            log.saves += 1;
                            log.others_at_save = vec![
                                steps[1].load(Ordering::SeqCst),
                                steps[2].load(Ordering::SeqCst),
                            ];
                            // Parked workers stay parked while the save runs.
                            thread::sleep(Duration::from_millis(20));
                            assert_eq!(steps[1].load(Ordering::SeqCst), CHECKPOINT_STEP);
                            assert_eq!(steps[2].load(Ordering::SeqCst), CHECKPOINT_STEP);
                            Ok(())
                        },
                    )
                    .unwrap();
            } else {
                barrier.step_boundary().unwrap();
            }
        }
    }

    for follower in followers {
        follower.join().unwrap();
    }

    barrier.with_observer(|log| {
        assert_eq!(log.saves, 1);
        assert_eq!(log.others_at_save, vec![CHECKPOINT_STEP, CHECKPOINT_STEP]);
    });
    for step in steps.iter() {
        assert_eq!(step.load(Ordering::SeqCst), LAST_STEP);
    }
}

#[test]
fn test_reports_are_serialized() {
    let barrier = Arc::new(CheckpointBarrier::new(0usize, 4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _registration = WorkerRegistration::new(&*barrier);
                for _ in 0..100 {
                    barrier
                        .report(
                            |count| {
                                *count += 1;
                                *count % 25 == 0
                            },
                            |_| Ok(()),
                        )
                        .unwrap();
                    barrier.step_boundary().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(barrier.with_observer(|count| *count), 400);
}
