//! Per-device work dispatch.
//!
//! The dispatcher owns one rayon pool with exactly one thread per local
//! device, built once and reused for every call. In parallel mode each
//! device's closure runs on its own pool thread via
//! [`rayon::ThreadPool::broadcast`], so a closure that blocks inside a
//! collective can never starve another device's closure of a thread.

use crate::distributed::partition::ShardRange;
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

pub struct DeviceDispatcher {
    pool: ThreadPool,
    num_devices: usize,
}

impl DeviceDispatcher {
    /// Builds the pool for `num_devices` devices.
    pub fn new(num_devices: usize) -> Result<Self> {
        if num_devices == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatcher needs at least one device".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_devices)
            .thread_name(|i| format!("shardsync-device-{i}"))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("failed to build device pool: {e}")))?;
        Ok(Self { pool, num_devices })
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Calls `f(device, range)` once per entry of `ranges` and blocks until
    /// every call returned.
    ///
    /// With `parallel` set (and more than one device) each call runs on a
    /// distinct pool thread. Otherwise the calls run on the caller's thread
    /// in device order. Either way every call runs to completion and the
    /// first error in device order is returned.
    pub fn for_each_device<F>(&self, ranges: &[ShardRange], parallel: bool, f: F) -> Result<()>
    where
        F: Fn(usize, ShardRange) -> Result<()> + Sync,
    {
        self.check_devices(ranges.len())?;

        let results: Vec<Result<()>> = if parallel && ranges.len() > 1 {
            self.pool
                .broadcast(|ctx| {
                    let device = ctx.index();
                    match ranges.get(device) {
                        Some(&range) => f(device, range),
                        None => Ok(()),
                    }
                })
        } else {
            ranges
                .iter()
                .enumerate()
                .map(|(device, &range)| f(device, range))
                .collect()
        };

        results.into_iter().collect()
    }

    /// Like [`for_each_device`](Self::for_each_device), collecting each
    /// device's return value in device order.
    pub fn map_devices<T, F>(&self, ranges: &[ShardRange], parallel: bool, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, ShardRange) -> Result<T> + Sync,
    {
        let slots: Vec<Mutex<Option<T>>> = ranges.iter().map(|_| Mutex::new(None)).collect();
        self.for_each_device(ranges, parallel, |device, range| {
            *slots[device].lock() = Some(f(device, range)?);
            Ok(())
        })?;
        slots
            .into_iter()
            .enumerate()
            .map(|(device, slot)| {
                slot.into_inner().ok_or_else(|| SyncError::Worker {
                    device,
                    message: "device produced no result".to_string(),
                })
            })
            .collect()
    }

    /// Like [`for_each_device`](Self::for_each_device), but hands each call
    /// the mutable chunk `data[range]`.
    ///
    /// `ranges` must be sorted and non-overlapping.
    pub fn for_each_chunk_mut<F>(
        &self,
        data: &mut [f32],
        ranges: &[ShardRange],
        parallel: bool,
        f: F,
    ) -> Result<()>
    where
        F: Fn(usize, ShardRange, &mut [f32]) -> Result<()> + Sync,
    {
        let chunks = split_disjoint(data, ranges)?;
        self.for_each_device(ranges, parallel, |device, range| {
            let mut chunk = chunks[device].lock();
            f(device, range, &mut **chunk)
        })
    }

    fn check_devices(&self, requested: usize) -> Result<()> {
        if requested > self.num_devices {
            return Err(SyncError::InvalidConfig(format!(
                "{requested} ranges for a dispatcher of {} devices",
                self.num_devices
            )));
        }
        Ok(())
    }
}

fn split_disjoint<'a>(data: &'a mut [f32], ranges: &[ShardRange]) -> Result<Vec<Mutex<&'a mut [f32]>>> {
    let mut chunks = Vec::with_capacity(ranges.len());
    let mut rest = data;
    let mut offset = 0;
    for range in ranges {
        if range.begin < offset || range.end < range.begin || range.end - offset > rest.len() {
            return Err(SyncError::InvalidConfig(format!(
                "chunk range [{}, {}) is out of order or out of bounds",
                range.begin, range.end
            )));
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(range.begin - offset);
        let (chunk, tail) = tail.split_at_mut(range.len());
        chunks.push(Mutex::new(chunk));
        rest = tail;
        offset = range.end;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::partition::shard_ranges;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_each_device_called_once() {
        let dispatcher = DeviceDispatcher::new(4).unwrap();
        let ranges = shard_ranges(40, 4).unwrap();
        for parallel in [false, true] {
            let seen = Mutex::new(Vec::new());
            dispatcher
                .for_each_device(&ranges, parallel, |device, range| {
                    seen.lock().push((device, range));
                    Ok(())
                })
                .unwrap();
            let mut seen = seen.into_inner();
            seen.sort_by_key(|(d, _)| *d);
            let expected: Vec<_> = ranges.iter().copied().enumerate().collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_parallel_calls_run_on_distinct_threads() {
        // All four closures must be live at once to get past the barrier.
        let dispatcher = DeviceDispatcher::new(4).unwrap();
        let ranges = shard_ranges(8, 4).unwrap();
        let barrier = Barrier::new(4);
        let names = Mutex::new(HashSet::new());
        dispatcher
            .for_each_device(&ranges, true, |_, _| {
                barrier.wait();
                names
                    .lock()
                    .insert(std::thread::current().name().map(str::to_string));
                Ok(())
            })
            .unwrap();
        assert_eq!(names.into_inner().len(), 4);
    }

    #[test]
    fn test_first_error_in_device_order_after_all_ran() {
        let dispatcher = DeviceDispatcher::new(3).unwrap();
        let ranges = shard_ranges(9, 3).unwrap();
        for parallel in [false, true] {
            let calls = AtomicUsize::new(0);
            let err = dispatcher
                .for_each_device(&ranges, parallel, |device, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if device >= 1 {
                        Err(SyncError::Comm(format!("device {device}")))
                    } else {
                        Ok(())
                    }
                })
                .unwrap_err();
            assert_eq!(calls.load(Ordering::SeqCst), 3);
            assert_eq!(err.to_string(), "communication error: device 1");
        }
    }

    #[test]
    fn test_map_devices_keeps_device_order() {
        let dispatcher = DeviceDispatcher::new(3).unwrap();
        let ranges = shard_ranges(9, 3).unwrap();
        let begins = dispatcher
            .map_devices(&ranges, true, |device, range| Ok((device, range.begin)))
            .unwrap();
        assert_eq!(begins, vec![(0, 0), (1, 3), (2, 6)]);
    }

    #[test]
    fn test_chunks_are_disjoint_views() {
        let dispatcher = DeviceDispatcher::new(2).unwrap();
        let ranges = shard_ranges(6, 2).unwrap();
        let mut data = vec![0.0f32; 6];
        dispatcher
            .for_each_chunk_mut(&mut data, &ranges, true, |device, range, chunk| {
                assert_eq!(chunk.len(), range.len());
                chunk.iter_mut().for_each(|x| *x = device as f32 + 1.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(data, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_too_many_ranges_rejected() {
        let dispatcher = DeviceDispatcher::new(1).unwrap();
        let ranges = shard_ranges(4, 2).unwrap();
        assert!(dispatcher.for_each_device(&ranges, true, |_, _| Ok(())).is_err());
        assert!(DeviceDispatcher::new(0).is_err());
    }
}
