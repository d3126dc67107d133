//! Workspace partitioning for flash attention
//!
//! ```text
//! 0                 scratch            scratch + stat       total
//! ├─ kernel scratch ─┼── softmax max ───┼── softmax sum ───┤
//! ```

use super::info::AttentionShape;
use crate::dtype::DType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Per-query padding of the softmax statistics imposed by the kernel.
pub const SOFTMAX_STAT_PAD: usize = 8;

/// Element type of the softmax statistics.
pub const SOFTMAX_STAT_DTYPE: DType = DType::F32;

/// Byte layout of the workspace a descriptor needs on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceLayout {
    kernel_scratch_size: usize,
    stat_buffer_size: usize,
    softmax_max_offset: usize,
    softmax_sum_offset: usize,
    total_size: usize,
}

impl WorkspaceLayout {
    /// Shape of each statistics tensor: `[B, num_heads, S_q, 8]`.
    pub fn statistics_shape(shape: &AttentionShape) -> [usize; 4] {
        [
            shape.batch(),
            shape.num_heads(),
            shape.query_len(),
            SOFTMAX_STAT_PAD,
        ]
    }

    /// Lay out the scratch region followed by the two statistics buffers.
    pub fn new(shape: &AttentionShape, kernel_scratch_size: usize) -> Result<Self> {
        let overflow = || Error::shape("workspace size overflows usize");

        let stat_buffer_size = Self::statistics_shape(shape)
            .iter()
            .try_fold(SOFTMAX_STAT_DTYPE.size_in_bytes(), |acc, &d| {
                acc.checked_mul(d)
            })
            .ok_or_else(overflow)?;
        let softmax_max_offset = kernel_scratch_size;
        let softmax_sum_offset = softmax_max_offset
            .checked_add(stat_buffer_size)
            .ok_or_else(overflow)?;
        let total_size = softmax_sum_offset
            .checked_add(stat_buffer_size)
            .ok_or_else(overflow)?;

        Ok(Self {
            kernel_scratch_size,
            stat_buffer_size,
            softmax_max_offset,
            softmax_sum_offset,
            total_size,
        })
    }

    pub fn kernel_scratch_size(&self) -> usize {
        self.kernel_scratch_size
    }

    /// Bytes of one statistics buffer.
    pub fn stat_buffer_size(&self) -> usize {
        self.stat_buffer_size
    }

    pub fn softmax_max_offset(&self) -> usize {
        self.softmax_max_offset
    }

    pub fn softmax_sum_offset(&self) -> usize {
        self.softmax_sum_offset
    }

    /// Minimum workspace, in bytes, accepted by `calculate`.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn scratch_range(&self) -> Range<usize> {
        0..self.kernel_scratch_size
    }

    pub fn softmax_max_range(&self) -> Range<usize> {
        self.softmax_max_offset..self.softmax_sum_offset
    }

    pub fn softmax_sum_range(&self) -> Range<usize> {
        self.softmax_sum_offset..self.total_size
    }
}
