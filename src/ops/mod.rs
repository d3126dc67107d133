pub mod cpu;
pub mod flash_attention;
pub mod traits;

pub use flash_attention::{AttentionShape, FlashAttentionDescriptor, FlashAttentionParams};
pub use traits::{DeviceBuffer, Executor, FlashAttentionBackend, OpBackend};
