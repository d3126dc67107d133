pub mod flash;

pub use flash::{CpuFlashExecutor, KV_BLOCK};
