//! # flashop
//!
//! **Flash attention operator descriptor: shape resolution, planning and
//! workspace negotiation over pluggable accelerator backends.**
//!
//! An operator is used in two phases:
//!
//! ```text
//! create(backend, out, q, k, v, mask?)      once per shape
//!   ├─ resolve + validate descriptors       AttentionShape
//!   ├─ derive kernel parameters             FlashAttentionParams
//!   ├─ plan on the backend                  Executor + kernel scratch size
//!   └─ publish workspace size               scratch ++ softmax max ++ softmax sum
//!
//! calculate(workspace, out, q, k, v, mask?, stream)   many times
//!   └─ rebind buffers into the plan, launch
//! ```
//!
//! ## Design
//!
//! - **Backend traits**: [`OpBackend`] and [`FlashAttentionBackend`] are the
//!   only surface an accelerator binding implements
//! - **Opaque plans**: native descriptors and executors are owned by the
//!   descriptor and released on drop
//! - **Host backend**: [`ops::cpu::CpuBackend`] runs an online-softmax kernel
//!   on host memory and serves as the reference implementation

pub mod dtype;
pub mod error;
pub mod ops;
pub mod tensor;

pub use dtype::DType;
pub use error::{Error, Result};
pub use ops::flash_attention::{
    AttentionShape, FlashAttentionDescriptor, FlashAttentionParams, WorkspaceLayout,
};
pub use ops::traits::{DeviceBuffer, Executor, FlashAttentionBackend, OpBackend};
pub use tensor::TensorDesc;
