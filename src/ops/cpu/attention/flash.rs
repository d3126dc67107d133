//! Host flash attention: planning and the online-softmax kernel
//!
//! For every (batch, head, query) row the kernel streams key positions in
//! blocks of [`KV_BLOCK`], keeping a running max `m`, running sum `l` and an
//! unnormalized accumulator in the workspace scratch region:
//!
//! ```text
//! m' = max(m, max_j s_j)
//! l' = l * exp(m - m') + Σ_j exp(s_j - m')
//! o' = o * exp(m - m') + Σ_j exp(s_j - m') * v_j
//! ```
//!
//! and finally writes `o / l` plus the row's `m` and `l`, each replicated over
//! the 8 padded statistics slots.
//!
//! Both sparse modes leave masking to the mask tensor: `pre_tokens` and
//! `next_tokens` are carried in the plan but do not restrict the window.

use half::{bf16, f16};

use crate::error::{Error, Result};
use crate::ops::cpu::backend::{CpuBackend, CpuDType, CpuStream, CpuTensor};
use crate::ops::flash_attention::{SOFTMAX_STAT_PAD, SparseMode};
use crate::ops::traits::attention::flash::{
    FlashAttentionBackend, FlashAttentionPlanRequest, slots,
};
use crate::ops::traits::backend::{DevicePtr, Executor};

/// Key positions scored per online-softmax step.
pub const KV_BLOCK: usize = 64;

const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 3;
const SCRATCH_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FloatDType {
    F32,
    F16,
    BF16,
}

impl FloatDType {
    fn from_native(dtype: CpuDType) -> Option<Self> {
        match dtype {
            CpuDType::F32 => Some(FloatDType::F32),
            CpuDType::F16 => Some(FloatDType::F16),
            CpuDType::BF16 => Some(FloatDType::BF16),
            CpuDType::Bool | CpuDType::U8 | CpuDType::I8 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskKind {
    /// One byte per element; non-zero excludes the position.
    Exclude,
    /// Added to the scaled score.
    Additive(FloatDType),
}

#[derive(Debug, Clone, Copy)]
struct MaskPlan {
    kind: MaskKind,
    /// Element strides over `[B, num_heads, S_q, S_kv]`, 0 on broadcast axes.
    strides: [usize; 4],
}

#[derive(Debug, Clone)]
struct KernelPlan {
    batch: usize,
    query_len: usize,
    kv_len: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim_qk: usize,
    head_dim_v: usize,
    group: usize,
    scale: f32,
    input: FloatDType,
    output: FloatDType,
    mask: Option<MaskPlan>,
}

/// Scratch bytes: one block of scores plus one accumulator row.
pub fn scratch_size(head_dim_v: usize) -> usize {
    ((KV_BLOCK + head_dim_v) * std::mem::size_of::<f32>()).next_multiple_of(SCRATCH_ALIGN)
}

/// Prepared host flash attention plan.
#[derive(Debug)]
pub struct CpuFlashExecutor {
    plan: KernelPlan,
    scratch_size: usize,
    repeatable: bool,
    launched: bool,
    inputs: [Option<DevicePtr>; INPUT_SLOTS],
    outputs: [Option<DevicePtr>; OUTPUT_SLOTS],
}

impl CpuFlashExecutor {
    pub fn scratch_size(&self) -> usize {
        self.scratch_size
    }

    fn input(&self, slot: usize) -> Result<DevicePtr> {
        self.inputs[slot].ok_or_else(|| Error::execution(format!("input slot {slot} is unbound")))
    }

    fn output(&self, slot: usize) -> Result<DevicePtr> {
        self.outputs[slot]
            .ok_or_else(|| Error::execution(format!("output slot {slot} is unbound")))
    }
}

impl FlashAttentionBackend for CpuBackend {
    fn plan_flash_attention(
        &self,
        request: &FlashAttentionPlanRequest<'_, Self>,
    ) -> Result<(usize, CpuFlashExecutor)> {
        let shape = request.shape;
        let params = request.params;

        let limit = self.limits().max_head_dim;
        if shape.head_dim_qk() > limit || shape.head_dim_v() > limit {
            return Err(Error::planning(format!(
                "head dims qk={} v={} exceed host kernel limit {limit}",
                shape.head_dim_qk(),
                shape.head_dim_v()
            )));
        }

        match (params.sparse_mode, request.mask) {
            (SparseMode::AllMask, None) => {
                return Err(Error::planning("sparse mode 1 requires a mask tensor"));
            }
            (SparseMode::Dense, Some(_)) => {
                return Err(Error::planning("sparse mode 0 does not accept a mask tensor"));
            }
            _ => {}
        }

        let check_extents = |name: &str, t: &CpuTensor, dims: &[usize]| -> Result<()> {
            if t.shape() != dims {
                return Err(Error::planning(format!(
                    "{name} descriptor extents {:?} do not match {dims:?}",
                    t.shape()
                )));
            }
            Ok(())
        };
        check_extents("q", request.q, &shape.q_dims())?;
        check_extents("k", request.k, &shape.k_dims())?;
        check_extents("v", request.v, &shape.v_dims())?;
        check_extents("out", request.out, &shape.out_dims())?;
        let stat_dims = [
            shape.batch(),
            shape.num_heads(),
            shape.query_len(),
            SOFTMAX_STAT_PAD,
        ];
        check_extents("softmax_max", request.softmax_max, &stat_dims)?;
        check_extents("softmax_sum", request.softmax_sum, &stat_dims)?;

        let input_dtype = request.q.dtype();
        if request.k.dtype() != input_dtype || request.v.dtype() != input_dtype {
            return Err(Error::planning(format!(
                "q/k/v dtype mismatch: q={:?}, k={:?}, v={:?}",
                input_dtype,
                request.k.dtype(),
                request.v.dtype()
            )));
        }
        let input = FloatDType::from_native(input_dtype).ok_or_else(|| {
            Error::planning(format!("no host kernel for {input_dtype:?} inputs"))
        })?;
        let output = FloatDType::from_native(request.out.dtype()).ok_or_else(|| {
            Error::planning(format!("no host kernel for {:?} output", request.out.dtype()))
        })?;
        for stat in [request.softmax_max, request.softmax_sum] {
            if stat.dtype() != CpuDType::F32 {
                return Err(Error::planning(format!(
                    "softmax statistics must be F32, got {:?}",
                    stat.dtype()
                )));
            }
        }

        let mask = request.mask.map(plan_mask).transpose()?;

        let plan = KernelPlan {
            batch: shape.batch(),
            query_len: shape.query_len(),
            kv_len: shape.kv_len(),
            num_heads: shape.num_heads(),
            num_kv_heads: shape.num_kv_heads(),
            head_dim_qk: shape.head_dim_qk(),
            head_dim_v: shape.head_dim_v(),
            group: shape.group_size(),
            scale: params.scale as f32,
            input,
            output,
            mask,
        };
        let scratch = scratch_size(plan.head_dim_v);

        Ok((
            scratch,
            CpuFlashExecutor {
                plan,
                scratch_size: scratch,
                repeatable: false,
                launched: false,
                inputs: [None; INPUT_SLOTS],
                outputs: [None; OUTPUT_SLOTS],
            },
        ))
    }
}

fn plan_mask(mask: &CpuTensor) -> Result<MaskPlan> {
    let kind = match mask.dtype() {
        CpuDType::Bool | CpuDType::U8 | CpuDType::I8 => MaskKind::Exclude,
        CpuDType::F32 => MaskKind::Additive(FloatDType::F32),
        CpuDType::F16 => MaskKind::Additive(FloatDType::F16),
        CpuDType::BF16 => MaskKind::Additive(FloatDType::BF16),
    };
    let dims = mask.shape();
    if dims.len() > 4 {
        return Err(Error::planning(format!(
            "mask rank {} exceeds 4",
            dims.len()
        )));
    }

    let mut padded = [1usize; 4];
    padded[4 - dims.len()..].copy_from_slice(dims);
    let mut strides = [0usize; 4];
    let mut acc = 1;
    for axis in (0..4).rev() {
        strides[axis] = if padded[axis] == 1 { 0 } else { acc };
        acc *= padded[axis];
    }
    Ok(MaskPlan { kind, strides })
}

impl Executor for CpuFlashExecutor {
    type Stream = CpuStream;

    fn set_repeatable(&mut self) -> Result<()> {
        self.repeatable = true;
        Ok(())
    }

    fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    fn bind_input(&mut self, slot: usize, ptr: DevicePtr) -> Result<()> {
        if slot == slots::MASK && self.plan.mask.is_none() {
            return Err(Error::execution("plan was built without a mask slot"));
        }
        let entry = self
            .inputs
            .get_mut(slot)
            .ok_or_else(|| Error::execution(format!("input slot {slot} out of range")))?;
        *entry = Some(ptr);
        Ok(())
    }

    fn bind_output(&mut self, slot: usize, ptr: DevicePtr) -> Result<()> {
        let entry = self
            .outputs
            .get_mut(slot)
            .ok_or_else(|| Error::execution(format!("output slot {slot} out of range")))?;
        *entry = Some(ptr);
        Ok(())
    }

    unsafe fn launch(
        &mut self,
        workspace: DevicePtr,
        workspace_size: usize,
        stream: &CpuStream,
    ) -> Result<()> {
        if self.launched && !self.repeatable {
            return Err(Error::execution(
                "executor is not repeatable and has already been launched",
            ));
        }
        if workspace_size < self.scratch_size {
            return Err(Error::execution(format!(
                "workspace of {workspace_size} B is smaller than the {} B scratch",
                self.scratch_size
            )));
        }

        let mask = match self.plan.mask {
            Some(_) => Some(self.input(slots::MASK)? as *const u8),
            None => None,
        };
        let args = KernelArgs {
            q: self.input(slots::Q)? as *const u8,
            k: self.input(slots::K)? as *const u8,
            v: self.input(slots::V)? as *const u8,
            mask,
            out: self.output(slots::OUT)? as *mut u8,
            softmax_max: self.output(slots::SOFTMAX_MAX)? as *mut u8,
            softmax_sum: self.output(slots::SOFTMAX_SUM)? as *mut u8,
            scratch: workspace as *mut u8,
        };

        // SAFETY: the caller guarantees every bound address and the scratch
        // region are live and sized for this plan.
        unsafe { run(&self.plan, &args) };

        self.launched = true;
        stream.record_launch();
        Ok(())
    }
}

impl Drop for CpuFlashExecutor {
    fn drop(&mut self) {
        log::trace!(
            "releasing host flash attention executor (repeatable={}, launched={})",
            self.repeatable,
            self.launched
        );
    }
}

struct KernelArgs {
    q: *const u8,
    k: *const u8,
    v: *const u8,
    mask: Option<*const u8>,
    out: *mut u8,
    softmax_max: *mut u8,
    softmax_sum: *mut u8,
    scratch: *mut u8,
}

unsafe fn run(p: &KernelPlan, a: &KernelArgs) {
    let scores = a.scratch;
    let acc = unsafe { a.scratch.add(KV_BLOCK * std::mem::size_of::<f32>()) };

    for b in 0..p.batch {
        for h in 0..p.num_heads {
            let kv_head = h / p.group;
            for i in 0..p.query_len {
                let q_row = ((b * p.query_len + i) * p.num_heads + h) * p.head_dim_qk;
                let mut m = f32::NEG_INFINITY;
                let mut l = 0.0f32;
                for d in 0..p.head_dim_v {
                    unsafe { store_f32(acc, d, 0.0) };
                }

                let mut start = 0;
                while start < p.kv_len {
                    let len = KV_BLOCK.min(p.kv_len - start);

                    let mut block_max = f32::NEG_INFINITY;
                    for t in 0..len {
                        let j = start + t;
                        let s = unsafe { score(p, a, b, h, i, j, q_row, kv_head) };
                        unsafe { store_f32(scores, t, s) };
                        block_max = block_max.max(s);
                    }

                    if block_max > f32::NEG_INFINITY {
                        let m_new = m.max(block_max);
                        let alpha = (m - m_new).exp();
                        l *= alpha;
                        for d in 0..p.head_dim_v {
                            unsafe { store_f32(acc, d, load_f32(acc, d) * alpha) };
                        }
                        for t in 0..len {
                            let s = unsafe { load_f32(scores, t) };
                            if s == f32::NEG_INFINITY {
                                continue;
                            }
                            let prob = (s - m_new).exp();
                            l += prob;
                            let j = start + t;
                            let v_row =
                                ((b * p.kv_len + j) * p.num_kv_heads + kv_head) * p.head_dim_v;
                            for d in 0..p.head_dim_v {
                                unsafe {
                                    let vd = load(a.v, p.input, v_row + d);
                                    store_f32(acc, d, load_f32(acc, d) + prob * vd);
                                }
                            }
                        }
                        m = m_new;
                    }

                    start += len;
                }

                let o_row = ((b * p.query_len + i) * p.num_heads + h) * p.head_dim_v;
                let inv = if l > 0.0 { l.recip() } else { 0.0 };
                for d in 0..p.head_dim_v {
                    unsafe { store(a.out, p.output, o_row + d, load_f32(acc, d) * inv) };
                }

                let stat_row = ((b * p.num_heads + h) * p.query_len + i) * SOFTMAX_STAT_PAD;
                for pad in 0..SOFTMAX_STAT_PAD {
                    unsafe {
                        store_f32(a.softmax_max, stat_row + pad, m);
                        store_f32(a.softmax_sum, stat_row + pad, l);
                    }
                }
            }
        }
    }
}

/// Scaled score of query `i` against key `j`, `-inf` when masked out.
#[allow(clippy::too_many_arguments)]
unsafe fn score(
    p: &KernelPlan,
    a: &KernelArgs,
    b: usize,
    h: usize,
    i: usize,
    j: usize,
    q_row: usize,
    kv_head: usize,
) -> f32 {
    let mut bias = 0.0f32;
    if let (Some(mask), Some(ptr)) = (p.mask, a.mask) {
        let [sb, sh, si, sj] = mask.strides;
        let idx = b * sb + h * sh + i * si + j * sj;
        match mask.kind {
            MaskKind::Exclude => {
                if unsafe { *ptr.add(idx) } != 0 {
                    return f32::NEG_INFINITY;
                }
            }
            MaskKind::Additive(dtype) => bias = unsafe { load(ptr, dtype, idx) },
        }
    }

    let k_row = ((b * p.kv_len + j) * p.num_kv_heads + kv_head) * p.head_dim_qk;
    let mut dot = 0.0f32;
    for d in 0..p.head_dim_qk {
        unsafe {
            dot += load(a.q, p.input, q_row + d) * load(a.k, p.input, k_row + d);
        }
    }
    dot * p.scale + bias
}

#[inline]
unsafe fn load(ptr: *const u8, dtype: FloatDType, idx: usize) -> f32 {
    unsafe {
        match dtype {
            FloatDType::F32 => ptr.cast::<f32>().add(idx).read_unaligned(),
            FloatDType::F16 => f16::from_bits(ptr.cast::<u16>().add(idx).read_unaligned()).to_f32(),
            FloatDType::BF16 => {
                bf16::from_bits(ptr.cast::<u16>().add(idx).read_unaligned()).to_f32()
            }
        }
    }
}

#[inline]
unsafe fn store(ptr: *mut u8, dtype: FloatDType, idx: usize, value: f32) {
    unsafe {
        match dtype {
            FloatDType::F32 => ptr.cast::<f32>().add(idx).write_unaligned(value),
            FloatDType::F16 => ptr
                .cast::<u16>()
                .add(idx)
                .write_unaligned(f16::from_f32(value).to_bits()),
            FloatDType::BF16 => ptr
                .cast::<u16>()
                .add(idx)
                .write_unaligned(bf16::from_f32(value).to_bits()),
        }
    }
}

#[inline]
unsafe fn load_f32(ptr: *const u8, idx: usize) -> f32 {
    unsafe { load(ptr, FloatDType::F32, idx) }
}

#[inline]
unsafe fn store_f32(ptr: *mut u8, idx: usize, value: f32) {
    unsafe { store(ptr, FloatDType::F32, idx, value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::ops::cpu::backend::CpuKernelLimits;
    use crate::ops::cpu::buffer::HostBuffer;
    use crate::ops::flash_attention::{AttentionShape, FlashAttentionParams, WorkspaceLayout};
    use crate::ops::traits::backend::{DeviceBuffer, OpBackend};
    use crate::tensor::TensorDesc;
    use crate::test_utils::bsnd_descs;

    struct Native {
        q: CpuTensor,
        k: CpuTensor,
        v: CpuTensor,
        mask: Option<CpuTensor>,
        smax: CpuTensor,
        ssum: CpuTensor,
        out: CpuTensor,
    }

    fn native(backend: &CpuBackend, shape: &AttentionShape) -> Native {
        let dt = backend.native_dtype(shape.dtype()).unwrap();
        let stat = WorkspaceLayout::statistics_shape(shape);
        Native {
            q: backend.create_tensor(dt, &shape.q_dims()).unwrap(),
            k: backend.create_tensor(dt, &shape.k_dims()).unwrap(),
            v: backend.create_tensor(dt, &shape.v_dims()).unwrap(),
            mask: shape.mask().map(|m| {
                let mdt = backend.native_dtype(m.dtype).unwrap();
                backend.create_tensor(mdt, &m.dims).unwrap()
            }),
            smax: backend.create_tensor(CpuDType::F32, &stat).unwrap(),
            ssum: backend.create_tensor(CpuDType::F32, &stat).unwrap(),
            out: backend.create_tensor(dt, &shape.out_dims()).unwrap(),
        }
    }

    fn plan(
        backend: &CpuBackend,
        shape: &AttentionShape,
        params: &FlashAttentionParams,
        n: &Native,
    ) -> Result<(usize, CpuFlashExecutor)> {
        backend.plan_flash_attention(&FlashAttentionPlanRequest {
            shape,
            params,
            q: &n.q,
            k: &n.k,
            v: &n.v,
            mask: n.mask.as_ref(),
            softmax_max: &n.smax,
            softmax_sum: &n.ssum,
            out: &n.out,
        })
    }

    fn small_shape() -> AttentionShape {
        let (out, q, k, v) = bsnd_descs(1, 2, 3, 1, 1, 4, 4, DType::F32);
        AttentionShape::resolve(&out, &q, &k, &v, None).unwrap()
    }

    #[test]
    fn test_scratch_size_aligned() {
        assert_eq!(scratch_size(8), 320);
        assert_eq!(scratch_size(64), 512);
        assert_eq!(scratch_size(1) % SCRATCH_ALIGN, 0);
    }

    #[test]
    fn test_plan_rejects_large_head_dim() {
        let backend = CpuBackend::with_limits(CpuKernelLimits { max_head_dim: 2 });
        let shape = small_shape();
        let params = FlashAttentionParams::derive(&shape);
        let n = native(&backend, &shape);
        let err = plan(&backend, &shape, &params, &n).unwrap_err();
        assert!(matches!(err, Error::BackendPlanningError { .. }));
    }

    #[test]
    fn test_plan_rejects_sparse_mode_without_mask() {
        let backend = CpuBackend::new();
        let shape = small_shape();
        let mut params = FlashAttentionParams::derive(&shape);
        params.sparse_mode = SparseMode::AllMask;
        let n = native(&backend, &shape);
        let err = plan(&backend, &shape, &params, &n).unwrap_err();
        assert!(matches!(err, Error::BackendPlanningError { .. }));
    }

    #[test]
    fn test_plan_rejects_integer_output() {
        let backend = CpuBackend::new();
        let shape = small_shape();
        let params = FlashAttentionParams::derive(&shape);
        let mut n = native(&backend, &shape);
        n.out = backend.create_tensor(CpuDType::U8, &shape.out_dims()).unwrap();
        let err = plan(&backend, &shape, &params, &n).unwrap_err();
        assert!(matches!(err, Error::BackendPlanningError { .. }));
    }

    #[test]
    fn test_mask_broadcast_strides() {
        let backend = CpuBackend::new();
        let t = backend.create_tensor(CpuDType::Bool, &[3, 5]).unwrap();
        assert_eq!(plan_mask(&t).unwrap().strides, [0, 0, 5, 1]);
        let t = backend.create_tensor(CpuDType::F16, &[2, 1, 3, 5]).unwrap();
        let plan = plan_mask(&t).unwrap();
        assert_eq!(plan.strides, [15, 0, 5, 1]);
        assert_eq!(plan.kind, MaskKind::Additive(FloatDType::F16));
    }

    #[test]
    fn test_executor_slots_and_repeatability() {
        let backend = CpuBackend::new();
        let shape = small_shape();
        let params = FlashAttentionParams::derive(&shape);
        let n = native(&backend, &shape);
        let (scratch, mut exec) = plan(&backend, &shape, &params, &n).unwrap();
        assert!(!exec.is_repeatable());

        let q = HostBuffer::from_f32(&[0.1; 8]);
        let k = HostBuffer::from_f32(&[0.2; 12]);
        let v = HostBuffer::from_f32(&[1.0; 12]);
        let mut out = HostBuffer::zeroed(32);
        let mut smax = HostBuffer::zeroed(2 * 8 * 4);
        let mut ssum = HostBuffer::zeroed(2 * 8 * 4);
        let mut ws = HostBuffer::zeroed(scratch);
        let stream = CpuStream::new();

        assert!(matches!(
            exec.bind_input(slots::MASK, q.device_ptr()),
            Err(Error::BackendExecutionError { .. })
        ));
        assert!(exec.bind_output(7, out.device_ptr_mut()).is_err());

        exec.bind_input(slots::Q, q.device_ptr()).unwrap();
        exec.bind_input(slots::K, k.device_ptr()).unwrap();
        exec.bind_input(slots::V, v.device_ptr()).unwrap();
        exec.bind_output(slots::SOFTMAX_MAX, smax.device_ptr_mut()).unwrap();
        exec.bind_output(slots::SOFTMAX_SUM, ssum.device_ptr_mut()).unwrap();

        // out still unbound
        let ws_ptr = ws.device_ptr_mut();
        let err = unsafe { exec.launch(ws_ptr, scratch, &stream) }.unwrap_err();
        assert!(matches!(err, Error::BackendExecutionError { .. }));

        exec.bind_output(slots::OUT, out.device_ptr_mut()).unwrap();
        unsafe { exec.launch(ws_ptr, scratch, &stream) }.unwrap();
        assert_eq!(stream.launches(), 1);
        // v is all ones, so every output element is 1
        assert!(out.to_f32_vec().iter().all(|&x| (x - 1.0).abs() < 1e-6));

        let err = unsafe { exec.launch(ws_ptr, scratch, &stream) }.unwrap_err();
        assert!(matches!(err, Error::BackendExecutionError { .. }));

        exec.set_repeatable().unwrap();
        unsafe { exec.launch(ws_ptr, scratch, &stream) }.unwrap();
        assert_eq!(stream.launches(), 2);

        let err = unsafe { exec.launch(ws_ptr, scratch - 1, &stream) }.unwrap_err();
        assert!(matches!(err, Error::BackendExecutionError { .. }));
    }

    #[test]
    fn test_masked_plan_uses_mask_tensor() {
        let backend = CpuBackend::new();
        let (out, q, k, v) = bsnd_descs(1, 2, 3, 1, 1, 4, 4, DType::F32);
        let mask = TensorDesc::new(DType::U8, &[2, 3]);
        let shape = AttentionShape::resolve(&out, &q, &k, &v, Some(&mask)).unwrap();
        let params = FlashAttentionParams::derive(&shape);
        let n = native(&backend, &shape);
        let (_, exec) = plan(&backend, &shape, &params, &n).unwrap();
        assert_eq!(exec.plan.mask.unwrap().kind, MaskKind::Exclude);
    }
}
