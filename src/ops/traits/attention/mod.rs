pub mod flash;

pub use flash::{FlashAttentionBackend, FlashAttentionPlanRequest};
