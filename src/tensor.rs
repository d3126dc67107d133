//! Tensor descriptors: extents, strides and element type, no storage.

use crate::dtype::DType;
use crate::error::{Error, Result};

/// Describes a tensor without owning its data.
///
/// Strides are in elements. Descriptors are read-only inputs to operator
/// creation; operators never mutate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<isize>,
}

impl TensorDesc {
    /// Contiguous (row-major) descriptor.
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
        }
    }

    /// Descriptor with explicit element strides.
    pub fn with_strides(dtype: DType, shape: &[usize], strides: &[isize]) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::InvalidArgument {
                arg: "strides",
                reason: format!(
                    "rank mismatch: shape has {} axes, strides has {}",
                    shape.len(),
                    strides.len()
                ),
            });
        }
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element count, or `None` when it does not fit in `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Byte size, or `None` when it does not fit in `usize`.
    pub fn size_in_bytes(&self) -> Option<usize> {
        self.numel()?.checked_mul(self.dtype.size_in_bytes())
    }

    /// True when the strides are exactly the row-major strides of the shape.
    ///
    /// Axes of extent 1 may carry any stride.
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&dim, (&got, &want))| dim == 1 || got == want)
    }
}

/// Row-major strides. Saturates at `isize::MAX` for shapes too large to
/// address; such shapes fail `size_in_bytes` and are rejected by operators.
fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = 1isize;
    for (stride, &dim) in strides.iter_mut().zip(shape.iter()).rev() {
        *stride = acc;
        acc = acc.saturating_mul(isize::try_from(dim).unwrap_or(isize::MAX));
    }
    strides
}
