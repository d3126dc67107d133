//! Host backend: synchronous reference kernels over host memory.

pub mod attention;
pub mod backend;
pub mod buffer;

pub use attention::{CpuFlashExecutor, KV_BLOCK};
pub use backend::{CpuBackend, CpuDType, CpuKernelLimits, CpuStream, CpuTensor};
pub use buffer::HostBuffer;
