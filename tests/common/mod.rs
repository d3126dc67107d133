//! Shared helpers for flash attention integration tests.

#![allow(dead_code)]

use flashop::ops::cpu::HostBuffer;
use flashop::{DType, TensorDesc};

/// Extents of one attention problem in BSND order.
#[derive(Debug, Clone, Copy)]
pub struct Problem {
    pub batch: usize,
    pub query_len: usize,
    pub kv_len: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim_qk: usize,
    pub head_dim_v: usize,
}

impl Problem {
    /// Equal q/k and v head dims.
    pub fn new(
        batch: usize,
        query_len: usize,
        kv_len: usize,
        heads: usize,
        kv_heads: usize,
        d: usize,
    ) -> Self {
        Self {
            batch,
            query_len,
            kv_len,
            num_heads: heads,
            num_kv_heads: kv_heads,
            head_dim_qk: d,
            head_dim_v: d,
        }
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

    /// `(out, q, k, v)` descriptors.
    pub fn descs(&self, dtype: DType) -> (TensorDesc, TensorDesc, TensorDesc, TensorDesc) {
        (
            TensorDesc::new(dtype, &self.out_dims()),
            TensorDesc::new(dtype, &self.q_dims()),
            TensorDesc::new(dtype, &self.k_dims()),
            TensorDesc::new(dtype, &self.v_dims()),
        )
    }
}

/// Deterministic values in roughly `[-0.5, 0.5]`.
pub fn pattern(dims: &[usize], seed: f32) -> Vec<f32> {
    let n: usize = dims.iter().product();
    (0..n).map(|i| (i as f32 * 0.37 + seed).sin() * 0.5).collect()
}

pub struct Inputs {
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

impl Inputs {
    pub fn new(p: &Problem) -> Self {
        Self {
            q: pattern(&p.q_dims(), 0.1),
            k: pattern(&p.k_dims(), 1.3),
            v: pattern(&p.v_dims(), 2.7),
        }
    }

    pub fn buffers(&self) -> (HostBuffer, HostBuffer, HostBuffer) {
        (
            HostBuffer::from_f32(&self.q),
            HostBuffer::from_f32(&self.k),
            HostBuffer::from_f32(&self.v),
        )
    }
}

/// Mask value seen by query `(b, h, i)` at key `j`.
pub enum RefMask<'a> {
    None,
    /// `true` excludes the position.
    Exclude(&'a dyn Fn(usize, usize, usize, usize) -> bool),
    Additive(&'a dyn Fn(usize, usize, usize, usize) -> f32),
}

/// Naive `softmax(q kᵀ · scale + bias) v` in BSND layout.
pub fn reference_attention(p: &Problem, inputs: &Inputs, mask: RefMask<'_>) -> Vec<f32> {
    let scale = (p.head_dim_qk as f32).sqrt().recip();
    let group = p.num_heads / p.num_kv_heads;
    let mut out = vec![0.0f32; p.out_dims().iter().product()];

    for b in 0..p.batch {
        for h in 0..p.num_heads {
            let kvh = h / group;
            for i in 0..p.query_len {
                let q_row = ((b * p.query_len + i) * p.num_heads + h) * p.head_dim_qk;
                let mut scores = vec![f32::NEG_INFINITY; p.kv_len];
                for (j, s) in scores.iter_mut().enumerate() {
                    let bias = match &mask {
                        RefMask::None => 0.0,
                        RefMask::Exclude(f) => {
                            if f(b, h, i, j) {
                                continue;
                            }
                            0.0
                        }
                        RefMask::Additive(f) => f(b, h, i, j),
                    };
                    let k_row = ((b * p.kv_len + j) * p.num_kv_heads + kvh) * p.head_dim_qk;
                    let dot: f32 = (0..p.head_dim_qk)
                        .map(|d| inputs.q[q_row + d] * inputs.k[k_row + d])
                        .sum();
                    *s = dot * scale + bias;
                }

                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let o_row = ((b * p.query_len + i) * p.num_heads + h) * p.head_dim_v;
                if max == f32::NEG_INFINITY {
                    continue;
                }
                let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f32 = weights.iter().sum();
                for (j, w) in weights.iter().enumerate() {
                    let v_row = ((b * p.kv_len + j) * p.num_kv_heads + kvh) * p.head_dim_v;
                    for d in 0..p.head_dim_v {
                        out[o_row + d] += w / sum * inputs.v[v_row + d];
                    }
                }
            }
        }
    }
    out
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
