//! Numeric kernel parameters derived from an attention shape

use super::info::AttentionShape;
use serde::{Deserialize, Serialize};

/// Tensor axis order handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttentionLayout {
    /// batch, sequence, heads, head-dim
    #[serde(rename = "BSND")]
    Bsnd,
}

impl AttentionLayout {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttentionLayout::Bsnd => "BSND",
        }
    }
}

/// Whether the kernel consults a mask tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SparseMode {
    /// No mask; every key position is visible.
    Dense,
    /// A full mask tensor selects visible positions.
    AllMask,
}

impl SparseMode {
    /// Integer code understood by kernels.
    pub const fn code(self) -> i64 {
        match self {
            SparseMode::Dense => 0,
            SparseMode::AllMask => 1,
        }
    }
}

/// Kernel parameters for one planned attention problem.
///
/// Always derived from the shape, never supplied by the caller, so two
/// descriptors built from identical tensors plan identically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlashAttentionParams {
    /// Softmax scale, `1 / sqrt(head_dim_qk)`.
    pub scale: f64,
    /// Key positions before the diagonal a query may attend to.
    pub pre_tokens: i64,
    /// Key positions after the diagonal a query may attend to.
    pub next_tokens: i64,
    pub sparse_mode: SparseMode,
    pub layout: AttentionLayout,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    /// 0 selects the high-precision softmax path.
    pub inner_precise: i64,
}

impl FlashAttentionParams {
    pub fn derive(shape: &AttentionShape) -> Self {
        let query_len = shape.query_len() as i64;
        let kv_len = shape.kv_len() as i64;
        Self {
            scale: (shape.head_dim_qk() as f64).sqrt().recip(),
            pre_tokens: query_len,
            next_tokens: kv_len - query_len,
            sparse_mode: if shape.has_mask() {
                SparseMode::AllMask
            } else {
                SparseMode::Dense
            },
            layout: AttentionLayout::Bsnd,
            num_heads: shape.num_heads(),
            num_kv_heads: shape.num_kv_heads(),
            inner_precise: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::tensor::TensorDesc;
    use crate::test_utils::bsnd_descs;

    #[test]
    fn test_derive_unmasked() {
        let (out, q, k, v) = bsnd_descs(1, 4, 10, 8, 2, 64, 32, DType::BF16);
        let shape = AttentionShape::resolve(&out, &q, &k, &v, None).unwrap();
        let params = FlashAttentionParams::derive(&shape);

        assert!((params.scale - 0.125).abs() < 1e-12);
        assert_eq!(params.pre_tokens, 4);
        assert_eq!(params.next_tokens, 6);
        assert_eq!(params.sparse_mode, SparseMode::Dense);
        assert_eq!(params.sparse_mode.code(), 0);
        assert_eq!(params.layout.as_str(), "BSND");
        assert_eq!(params.num_heads, 8);
        assert_eq!(params.num_kv_heads, 2);
        assert_eq!(params.inner_precise, 0);
    }

    #[test]
    fn test_derive_masked_short_kv() {
        let (out, q, k, v) = bsnd_descs(1, 6, 2, 2, 2, 16, 16, DType::F32);
        let mask = TensorDesc::new(DType::Bool, &[6, 2]);
        let shape = AttentionShape::resolve(&out, &q, &k, &v, Some(&mask)).unwrap();
        let params = FlashAttentionParams::derive(&shape);

        assert_eq!(params.sparse_mode, SparseMode::AllMask);
        assert_eq!(params.sparse_mode.code(), 1);
        assert_eq!(params.pre_tokens, 6);
        assert_eq!(params.next_tokens, -4);
        assert!((params.scale - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_serialized_record() {
        let (out, q, k, v) = bsnd_descs(1, 4, 4, 2, 2, 4, 4, DType::F32);
        let shape = AttentionShape::resolve(&out, &q, &k, &v, None).unwrap();
        let json = serde_json::to_value(FlashAttentionParams::derive(&shape)).unwrap();

        assert_eq!(json["layout"], "BSND");
        assert_eq!(json["sparse_mode"], "Dense");
        assert_eq!(json["scale"], 0.5);
        assert_eq!(json["next_tokens"], 0);
    }
}
