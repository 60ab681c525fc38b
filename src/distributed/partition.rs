//! Shard partitioning.
//!
//! The flattened parameter vector of `data_size` elements is cut into
//! `num_ranks` contiguous shards of identical size `ceil(data_size / num_ranks)`.
//! Rank `r` owns `[r * shard_size, (r + 1) * shard_size)`.
//!
//! Uneven layouts are rejected rather than padded: the library backend passes
//! one fixed block size to `reduce_scatter`/`all_gather_v`, so a shorter last
//! shard would change the collective call contract.
//!
//! ```rust
//! use shardsync::distributed::partition::{shard_range, shard_size};
//!
//! assert_eq!(shard_size(400, 4).unwrap(), 100);
//! let r = shard_range(2, 400, 4).unwrap();
//! assert_eq!((r.begin, r.end), (200, 300));
//!
//! // 10 elements do not split evenly over 3 ranks.
//! assert!(shard_size(10, 3).is_err());
//! ```

use crate::error::{Result, SyncError};

/// A half-open index range `[begin, end)` of the flattened vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShardRange {
    pub begin: usize,
    pub end: usize,
}

impl ShardRange {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// The same range shifted left by `offset`, for indexing into a buffer
    /// that starts at `offset`.
    pub fn relative_to(&self, offset: usize) -> ShardRange {
        ShardRange::new(self.begin - offset, self.end - offset)
    }
}

/// One (process, local device) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rank {
    pub process_index: usize,
    pub local_device_index: usize,
    pub devices_per_process: usize,
}

impl Rank {
    pub fn new(process_index: usize, local_device_index: usize, devices_per_process: usize) -> Self {
        Self {
            process_index,
            local_device_index,
            devices_per_process,
        }
    }

    /// `process_index * devices_per_process + local_device_index`.
    pub fn global_rank(&self) -> usize {
        self.process_index * self.devices_per_process + self.local_device_index
    }
}

/// Size of every shard: `ceil(data_size / num_ranks)`.
///
/// # Errors
///
/// * `SyncError::InvalidConfig` if `num_ranks` is zero.
/// * `SyncError::UnevenShards` if `shard_size * num_ranks != data_size`.
pub fn shard_size(data_size: usize, num_ranks: usize) -> Result<usize> {
    if num_ranks == 0 {
        return Err(SyncError::InvalidConfig(
            "cannot shard over zero ranks".to_string(),
        ));
    }
    let size = data_size.div_ceil(num_ranks);
    if size * num_ranks != data_size {
        return Err(SyncError::UnevenShards {
            data_size,
            num_ranks,
            shard_size: size,
        });
    }
    Ok(size)
}

/// The range owned by `rank`.
pub fn shard_range(rank: usize, data_size: usize, num_ranks: usize) -> Result<ShardRange> {
    let size = shard_size(data_size, num_ranks)?;
    if rank >= num_ranks {
        return Err(SyncError::InvalidConfig(format!(
            "rank {rank} out of range for {num_ranks} ranks"
        )));
    }
    let begin = rank * size;
    // Clipping never triggers while shard_size enforces uniform shards.
    let end = (begin + size).min(data_size);
    Ok(ShardRange::new(begin, end))
}

/// Ranges for all ranks `0..num_ranks`, in rank order.
pub fn shard_ranges(data_size: usize, num_ranks: usize) -> Result<Vec<ShardRange>> {
    (0..num_ranks)
        .map(|rank| shard_range(rank, data_size, num_ranks))
        .collect()
}
