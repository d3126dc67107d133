//! Shape resolution for flash attention
//!
//! Turns the out/q/k/v/mask tensor descriptors into one canonical
//! [`AttentionShape`]. Every check runs before anything is built, so a
//! failure leaves no partial state behind.
//!
//! # Layout contract (BSND, contiguous)
//!
//! - `q`: `[B, S_q, num_heads, head_dim_qk]`
//! - `k`: `[B, S_kv, num_kv_heads, head_dim_qk]`
//! - `v`: `[B, S_kv, num_kv_heads, head_dim_v]`
//! - `out`: `[B, S_q, num_heads, head_dim_v]`
//! - `mask`: optional, rank 2..=4, broadcastable to `[B, num_heads, S_q, S_kv]`

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::TensorDesc;
use serde::{Deserialize, Serialize};

/// Element types accepted for q/k/v/out.
const QKV_DTYPES: [DType; 3] = [DType::F16, DType::BF16, DType::F32];

/// Element types accepted for the mask. Integer/bool masks exclude positions
/// where the element is non-zero; float masks are added to the scores.
const MASK_DTYPES: [DType; 6] = [
    DType::Bool,
    DType::U8,
    DType::I8,
    DType::F16,
    DType::BF16,
    DType::F32,
];

/// Canonical, validated dimensions of one attention problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttentionShape {
    batch: usize,
    query_len: usize,
    kv_len: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim_qk: usize,
    head_dim_v: usize,
    dtype: DType,
    mask: Option<MaskShape>,
}

/// Extents and element type of the optional mask.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskShape {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl AttentionShape {
    /// Validate the descriptors and build the canonical record.
    pub fn resolve(
        out: &TensorDesc,
        q: &TensorDesc,
        k: &TensorDesc,
        v: &TensorDesc,
        mask: Option<&TensorDesc>,
    ) -> Result<Self> {
        let [batch, query_len, num_heads, head_dim_qk] = bsnd_dims("q", q)?;
        let [k_batch, kv_len, num_kv_heads, k_head_dim] = bsnd_dims("k", k)?;
        let [v_batch, v_len, v_heads, head_dim_v] = bsnd_dims("v", v)?;
        let [o_batch, o_len, o_heads, o_head_dim] = bsnd_dims("out", out)?;

        if k_batch != batch || v_batch != batch || o_batch != batch {
            return Err(Error::shape(format!(
                "batch mismatch: q.B={batch}, k.B={k_batch}, v.B={v_batch}, out.B={o_batch}"
            )));
        }
        if o_len != query_len {
            return Err(Error::shape(format!(
                "out seq_len={o_len} != q seq_len={query_len}"
            )));
        }
        if o_heads != num_heads {
            return Err(Error::shape(format!(
                "out heads={o_heads} != q heads={num_heads}"
            )));
        }
        if v_len != kv_len {
            return Err(Error::shape(format!(
                "v seq_len={v_len} != k seq_len={kv_len}"
            )));
        }
        if v_heads != num_kv_heads {
            return Err(Error::shape(format!(
                "v heads={v_heads} != k heads={num_kv_heads}"
            )));
        }
        if k_head_dim != head_dim_qk {
            return Err(Error::shape(format!(
                "k head_dim={k_head_dim} != q head_dim={head_dim_qk}"
            )));
        }
        if o_head_dim != head_dim_v {
            return Err(Error::shape(format!(
                "out head_dim={o_head_dim} != v head_dim={head_dim_v}"
            )));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(Error::shape(format!(
                "num_heads ({num_heads}) must be divisible by num_kv_heads ({num_kv_heads})"
            )));
        }

        let dtype = q.dtype();
        if !QKV_DTYPES.contains(&dtype) {
            return Err(Error::UnsupportedDType {
                dtype,
                reason: "q/k/v must be f16, bf16 or f32".into(),
            });
        }
        for (name, t) in [("k", k), ("v", v), ("out", out)] {
            if t.dtype() != dtype {
                return Err(Error::UnsupportedDType {
                    dtype: t.dtype(),
                    reason: format!("{name} dtype must match q dtype {dtype}"),
                });
            }
        }

        let target = [batch, num_heads, query_len, kv_len];
        let mask = mask.map(|m| resolve_mask(m, target)).transpose()?;

        Ok(Self {
            batch,
            query_len,
            kv_len,
            num_heads,
            num_kv_heads,
            head_dim_qk,
            head_dim_v,
            dtype,
            mask,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn query_len(&self) -> usize {
        self.query_len
    }

    pub fn kv_len(&self) -> usize {
        self.kv_len
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim_qk(&self) -> usize {
        self.head_dim_qk
    }

    pub fn head_dim_v(&self) -> usize {
        self.head_dim_v
    }

    /// Element type shared by q/k/v/out.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    pub fn mask(&self) -> Option<&MaskShape> {
        self.mask.as_ref()
    }

    /// Query heads served by each kv head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn q_dims(&self) -> [usize; 4] {
        [self.batch, self.query_len, self.num_heads, self.head_dim_qk]
    }

    pub fn k_dims(&self) -> [usize; 4] {
        [self.batch, self.kv_len, self.num_kv_heads, self.head_dim_qk]
    }

    pub fn v_dims(&self) -> [usize; 4] {
        [self.batch, self.kv_len, self.num_kv_heads, self.head_dim_v]
    }

    pub fn out_dims(&self) -> [usize; 4] {
        [self.batch, self.query_len, self.num_heads, self.head_dim_v]
    }

    /// Minimum byte sizes of the q, k, v, out and mask buffers.
    ///
    /// `resolve` bounds each of these by `isize::MAX`.
    pub(crate) fn buffer_bytes(&self) -> BufferBytes {
        let elem = self.dtype.size_in_bytes();
        let bytes = |dims: [usize; 4]| dims.iter().product::<usize>() * elem;
        BufferBytes {
            q: bytes(self.q_dims()),
            k: bytes(self.k_dims()),
            v: bytes(self.v_dims()),
            out: bytes(self.out_dims()),
            mask: self
                .mask
                .as_ref()
                .map(|m| m.dims.iter().product::<usize>() * m.dtype.size_in_bytes()),
        }
    }
}

pub(crate) struct BufferBytes {
    pub q: usize,
    pub k: usize,
    pub v: usize,
    pub out: usize,
    pub mask: Option<usize>,
}

/// Check rank, extents and contiguity of a BSND operand.
fn bsnd_dims(name: &str, t: &TensorDesc) -> Result<[usize; 4]> {
    let dims: [usize; 4] = t.shape().try_into().map_err(|_| {
        Error::shape(format!(
            "{name}: expected 4D [B, S, N, D], got {}D",
            t.ndim()
        ))
    })?;
    if dims.contains(&0) {
        return Err(Error::shape(format!("{name}: zero-sized axis in {dims:?}")));
    }
    if !t.is_contiguous() {
        return Err(Error::shape(format!(
            "{name}: BSND operands must be contiguous, got strides {:?}",
            t.strides()
        )));
    }
    addressable_bytes(name, t)?;
    Ok(dims)
}

/// Byte size of `t`, rejecting shapes no buffer can hold.
///
/// Every size derived from a resolved shape is bounded by this, so later
/// arithmetic on it cannot overflow.
fn addressable_bytes(name: &str, t: &TensorDesc) -> Result<usize> {
    t.size_in_bytes()
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or_else(|| {
            Error::shape(format!(
                "{name}: {:?} x {} is too large to address",
                t.shape(),
                t.dtype()
            ))
        })
}

fn resolve_mask(mask: &TensorDesc, target: [usize; 4]) -> Result<MaskShape> {
    let ndim = mask.ndim();
    if !(2..=4).contains(&ndim) {
        return Err(Error::shape(format!(
            "mask: expected 2D to 4D broadcastable to {target:?}, got {ndim}D"
        )));
    }
    if !mask.is_contiguous() {
        return Err(Error::shape("mask: must be contiguous"));
    }
    addressable_bytes("mask", mask)?;
    let broadcastable = mask
        .shape()
        .iter()
        .rev()
        .zip(target.iter().rev())
        .all(|(&got, &want)| got == want || got == 1);
    if !broadcastable {
        return Err(Error::shape(format!(
            "mask shape {:?} is not broadcastable to {target:?}",
            mask.shape()
        )));
    }
    if !MASK_DTYPES.contains(&mask.dtype()) {
        return Err(Error::UnsupportedDType {
            dtype: mask.dtype(),
            reason: "mask must be bool, u8, i8, f16, bf16 or f32".into(),
        });
    }
    Ok(MaskShape {
        dims: mask.shape().to_vec(),
        dtype: mask.dtype(),
    })
}
