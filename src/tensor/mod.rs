//! Flat parameter/gradient tensors.
//!
//! Synchronization never cares about the shape of individual weight matrices:
//! a replica exposes its parameters and gradients as one flattened `f32`
//! vector, and every collective works on contiguous `[begin, end)` slices of
//! that vector. [`Tensor`] is that vector plus the handful of element-wise
//! operations the trainer and the backends need.
//!
//! ```rust
//! use shardsync::tensor::Tensor;
//! use shardsync::distributed::partition::ShardRange;
//!
//! let mut grads = Tensor::filled(8, 1.0);
//! grads.zero_outside(ShardRange::new(2, 4));
//! assert_eq!(grads.data(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
//! ```

use crate::distributed::partition::ShardRange;
use crate::error::{Result, SyncError};
use rayon::prelude::*;

/// Below this many elements the element-wise ops stay on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

/// A flat, contiguous vector of `f32` values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
}

impl Tensor {
    /// Wraps an existing vector.
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Creates a tensor of `size` zeros.
    pub fn zeros(size: usize) -> Self {
        Self {
            data: vec![0.0; size],
        }
    }

    /// Creates a tensor of `size` copies of `value`.
    pub fn filled(size: usize, value: f32) -> Self {
        Self {
            data: vec![value; size],
        }
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns the slice covered by `range`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::SizeMismatch` if the range runs past the end.
    pub fn subtensor(&self, range: ShardRange) -> Result<&[f32]> {
        self.check_range(range)?;
        Ok(&self.data[range.begin..range.end])
    }

    /// Mutable variant of [`Tensor::subtensor`].
    pub fn subtensor_mut(&mut self, range: ShardRange) -> Result<&mut [f32]> {
        self.check_range(range)?;
        Ok(&mut self.data[range.begin..range.end])
    }

    /// Overwrites the whole tensor with `src`.
    pub fn copy_from(&mut self, src: &[f32]) -> Result<()> {
        SyncError::check_len("tensor copy", self.data.len(), src.len())?;
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &[f32]) -> Result<()> {
        add_into(&mut self.data, other)
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Zeroes everything before `range.begin` and from `range.end` on.
    pub fn zero_outside(&mut self, range: ShardRange) {
        let size = self.data.len();
        let begin = range.begin.min(size);
        let end = range.end.min(size);
        self.data[..begin].iter_mut().for_each(|x| *x = 0.0);
        self.data[end..].iter_mut().for_each(|x| *x = 0.0);
    }

    fn check_range(&self, range: ShardRange) -> Result<()> {
        if range.begin > range.end || range.end > self.data.len() {
            return Err(SyncError::SizeMismatch {
                context: "subtensor range",
                expected: self.data.len(),
                got: range.end,
            });
        }
        Ok(())
    }
}

/// Element-wise `dst += src` over two equally sized slices.
pub fn add_into(dst: &mut [f32], src: &[f32]) -> Result<()> {
    SyncError::check_len("element-wise add", dst.len(), src.len())?;
    if dst.len() >= PAR_THRESHOLD {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(d, s)| *d += *s);
    } else {
        dst.iter_mut().zip(src).for_each(|(d, s)| *d += *s);
    }
    Ok(())
}
