//! Host reference backend
//!
//! Runs kernels synchronously on the calling thread. Device addresses are
//! host addresses of [`HostBuffer`] storage.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::attention::flash::CpuFlashExecutor;
use super::buffer::HostBuffer;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::traits::backend::{Device, DeviceKind, OpBackend};

/// Element types the host kernels understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuDType {
    F32,
    F16,
    BF16,
    Bool,
    U8,
    I8,
}

/// Host tensor descriptor: element type and extents, no storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTensor {
    dtype: CpuDType,
    shape: Vec<usize>,
}

impl CpuTensor {
    pub fn dtype(&self) -> CpuDType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Limits enforced when planning host kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuKernelLimits {
    /// Largest head dimension (q/k or v) a plan accepts.
    pub max_head_dim: usize,
}

impl Default for CpuKernelLimits {
    fn default() -> Self {
        Self { max_head_dim: 512 }
    }
}

/// Execution stream for the host backend.
///
/// Launches complete before `launch` returns, so the stream only keeps count.
#[derive(Debug, Default)]
pub struct CpuStream {
    launches: AtomicUsize,
}

impl CpuStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of launches submitted to this stream.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Wait for all submitted work. Always already done on the host.
    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn record_launch(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Host backend handle.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    limits: CpuKernelLimits,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: CpuKernelLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> CpuKernelLimits {
        self.limits
    }
}

impl OpBackend for CpuBackend {
    type NativeDType = CpuDType;
    type NativeTensor = CpuTensor;
    type Buffer = HostBuffer;
    type Stream = CpuStream;
    type Executor = CpuFlashExecutor;

    fn device(&self) -> Device {
        Device {
            kind: DeviceKind::Cpu,
            id: 0,
        }
    }

    fn native_dtype(&self, dtype: DType) -> Result<CpuDType> {
        match dtype {
            DType::F32 => Ok(CpuDType::F32),
            DType::F16 => Ok(CpuDType::F16),
            DType::BF16 => Ok(CpuDType::BF16),
            DType::Bool => Ok(CpuDType::Bool),
            DType::U8 => Ok(CpuDType::U8),
            DType::I8 => Ok(CpuDType::I8),
            DType::F64 | DType::I64 | DType::I32 => Err(Error::UnsupportedDType {
                dtype,
                reason: "no host kernel support".into(),
            }),
        }
    }

    fn create_tensor(&self, dtype: CpuDType, shape: &[usize]) -> Result<CpuTensor> {
        Ok(CpuTensor {
            dtype,
            shape: shape.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_dtype_mapping() {
        let backend = CpuBackend::new();
        assert_eq!(backend.native_dtype(DType::BF16).unwrap(), CpuDType::BF16);
        assert_eq!(backend.native_dtype(DType::Bool).unwrap(), CpuDType::Bool);
        let err = backend.native_dtype(DType::F64).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedDType {
                dtype: DType::F64,
                ..
            }
        ));
    }

    #[test]
    fn test_create_tensor() {
        let backend = CpuBackend::new();
        let t = backend.create_tensor(CpuDType::F16, &[1, 4, 2, 8]).unwrap();
        assert_eq!(t.shape(), &[1, 4, 2, 8]);
        assert_eq!(t.dtype(), CpuDType::F16);
    }

    #[test]
    fn test_device() {
        let backend = CpuBackend::new();
        assert_eq!(backend.device().to_string(), "cpu:0");
    }
}
