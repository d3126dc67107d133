pub mod attention;
pub mod backend;

pub use attention::{FlashAttentionBackend, FlashAttentionPlanRequest};
pub use backend::{Device, DeviceBuffer, DeviceKind, DevicePtr, Executor, OpBackend};
