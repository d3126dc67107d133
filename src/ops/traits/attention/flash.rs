//! Flash attention planning capability

use crate::error::Result;
use crate::ops::flash_attention::{AttentionShape, FlashAttentionParams};
use crate::ops::traits::backend::OpBackend;

/// Fixed slot order of a flash attention plan.
///
/// Inputs and outputs are numbered separately.
pub mod slots {
    pub const Q: usize = 0;
    pub const K: usize = 1;
    pub const V: usize = 2;
    /// Only bound when the plan was built with a mask.
    pub const MASK: usize = 3;

    pub const SOFTMAX_MAX: usize = 0;
    pub const SOFTMAX_SUM: usize = 1;
    pub const OUT: usize = 2;
}

/// Everything a backend needs to plan one flash attention problem.
///
/// # Layout contract
///
/// - `q`: `[B, S_q, num_heads, head_dim_qk]`
/// - `k`: `[B, S_kv, num_kv_heads, head_dim_qk]`
/// - `v`: `[B, S_kv, num_kv_heads, head_dim_v]`
/// - `mask`: the caller's mask extents, broadcastable to `[B, num_heads, S_q, S_kv]`
/// - `out`: `[B, S_q, num_heads, head_dim_v]`
/// - `softmax_max`, `softmax_sum`: `[B, num_heads, S_q, 8]`, F32
pub struct FlashAttentionPlanRequest<'a, B: OpBackend> {
    pub shape: &'a AttentionShape,
    pub params: &'a FlashAttentionParams,
    pub q: &'a B::NativeTensor,
    pub k: &'a B::NativeTensor,
    pub v: &'a B::NativeTensor,
    pub mask: Option<&'a B::NativeTensor>,
    pub softmax_max: &'a B::NativeTensor,
    pub softmax_sum: &'a B::NativeTensor,
    pub out: &'a B::NativeTensor,
}

/// Backends that can run flash attention.
pub trait FlashAttentionBackend: OpBackend + Sized {
    /// Plan the kernel once.
    ///
    /// Returns the kernel scratch size in bytes and an executor whose slots
    /// follow [`slots`]. Configurations the kernel cannot run are reported as
    /// `BackendPlanningError`.
    fn plan_flash_attention(
        &self,
        request: &FlashAttentionPlanRequest<'_, Self>,
    ) -> Result<(usize, Self::Executor)>;
}
