//! Flash attention operator descriptor
//!
//! Two-phase contract: [`FlashAttentionDescriptor::create`] validates the
//! tensor descriptors, plans the kernel once and publishes the workspace size;
//! [`FlashAttentionDescriptor::calculate`] rebinds live buffers into that same
//! plan and launches it, as many times as needed.

use std::sync::Mutex;

use super::info::AttentionShape;
use super::params::FlashAttentionParams;
use super::workspace::{SOFTMAX_STAT_DTYPE, WorkspaceLayout};
use crate::error::{Error, Result};
use crate::ops::traits::attention::flash::{
    FlashAttentionBackend, FlashAttentionPlanRequest, slots,
};
use crate::ops::traits::backend::{Device, DeviceBuffer, DevicePtr, Executor, OpBackend};
use crate::tensor::TensorDesc;

/// Backend-native state owned by a descriptor.
///
/// Each field releases its backend resource on drop, so a partially built
/// plan is cleaned up by simply returning early.
struct Opaque<B: OpBackend> {
    executor: Mutex<B::Executor>,
    out: B::NativeTensor,
    q: B::NativeTensor,
    k: B::NativeTensor,
    v: B::NativeTensor,
    mask: Option<B::NativeTensor>,
    softmax_max: B::NativeTensor,
    softmax_sum: B::NativeTensor,
}

/// A planned, repeatable flash attention operator.
///
/// The plan is valid only for buffers matching the shape it was created
/// with. `calculate` takes `&self`; binding and submission are serialized
/// internally, but concurrent calls must still use distinct workspaces.
pub struct FlashAttentionDescriptor<B: FlashAttentionBackend> {
    shape: AttentionShape,
    params: FlashAttentionParams,
    workspace: WorkspaceLayout,
    device: Device,
    opaque: Opaque<B>,
}

impl<B: FlashAttentionBackend> FlashAttentionDescriptor<B> {
    /// Validate the descriptors and build the execution plan.
    pub fn create(
        backend: &B,
        out: &TensorDesc,
        q: &TensorDesc,
        k: &TensorDesc,
        v: &TensorDesc,
        mask: Option<&TensorDesc>,
    ) -> Result<Self> {
        let shape = AttentionShape::resolve(out, q, k, v, mask)?;

        let native = |t: &TensorDesc, dims: &[usize]| -> Result<B::NativeTensor> {
            backend.create_tensor(backend.native_dtype(t.dtype())?, dims)
        };
        let out_t = native(out, &shape.out_dims())?;
        let q_t = native(q, &shape.q_dims())?;
        let k_t = native(k, &shape.k_dims())?;
        let v_t = native(v, &shape.v_dims())?;
        let mask_t = mask.map(|m| native(m, m.shape())).transpose()?;

        let stat_dtype = backend.native_dtype(SOFTMAX_STAT_DTYPE)?;
        let stat_shape = WorkspaceLayout::statistics_shape(&shape);
        let softmax_max = backend.create_tensor(stat_dtype, &stat_shape)?;
        let softmax_sum = backend.create_tensor(stat_dtype, &stat_shape)?;

        let params = FlashAttentionParams::derive(&shape);

        let request = FlashAttentionPlanRequest::<B> {
            shape: &shape,
            params: &params,
            q: &q_t,
            k: &k_t,
            v: &v_t,
            mask: mask_t.as_ref(),
            softmax_max: &softmax_max,
            softmax_sum: &softmax_sum,
            out: &out_t,
        };
        let (scratch_size, mut executor) = backend
            .plan_flash_attention(&request)
            .map_err(into_planning_error)?;
        executor.set_repeatable().map_err(into_planning_error)?;

        let workspace = WorkspaceLayout::new(&shape, scratch_size)?;
        let device = backend.device();

        log::debug!(
            "planned flash attention on {device}: {:?}, scratch {} B, workspace {} B",
            shape,
            workspace.kernel_scratch_size(),
            workspace.total_size()
        );

        Ok(Self {
            shape,
            params,
            workspace,
            device,
            opaque: Opaque {
                executor: Mutex::new(executor),
                out: out_t,
                q: q_t,
                k: k_t,
                v: v_t,
                mask: mask_t,
                softmax_max,
                softmax_sum,
            },
        })
    }

    /// Run the plan on live buffers.
    ///
    /// `workspace_size` must be at least [`workspace_size`](Self::workspace_size)
    /// and no larger than `workspace`. `mask` must be given exactly when the
    /// descriptor was created with a mask. On error nothing has been written,
    /// except for `BackendExecutionError` from the launch itself, after which
    /// `out` and the statistics regions are undefined.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        &self,
        workspace: &mut B::Buffer,
        workspace_size: usize,
        out: &mut B::Buffer,
        q: &B::Buffer,
        k: &B::Buffer,
        v: &B::Buffer,
        mask: Option<&B::Buffer>,
        stream: &B::Stream,
    ) -> Result<()> {
        let required = self.workspace.total_size();
        if workspace_size < required {
            return Err(Error::InsufficientWorkspace {
                required,
                provided: workspace_size,
            });
        }
        if workspace_size > workspace.len() {
            return Err(Error::InvalidArgument {
                arg: "workspace_size",
                reason: format!(
                    "declared {workspace_size} bytes but the buffer holds {}",
                    workspace.len()
                ),
            });
        }
        match (self.shape.has_mask(), mask.is_some()) {
            (true, false) => {
                return Err(Error::InvalidArgument {
                    arg: "mask",
                    reason: "descriptor was created with a mask but none was given".into(),
                });
            }
            (false, true) => {
                return Err(Error::InvalidArgument {
                    arg: "mask",
                    reason: "descriptor was created without a mask".into(),
                });
            }
            _ => {}
        }

        let bytes = self.shape.buffer_bytes();
        check_len("out", out.len(), bytes.out)?;
        check_len("q", q.len(), bytes.q)?;
        check_len("k", k.len(), bytes.k)?;
        check_len("v", v.len(), bytes.v)?;
        if let (Some(m), Some(need)) = (mask, bytes.mask) {
            check_len("mask", m.len(), need)?;
        }

        let ws = workspace.device_ptr_mut();
        let softmax_max = offset(ws, self.workspace.softmax_max_offset());
        let softmax_sum = offset(ws, self.workspace.softmax_sum_offset());

        let mut executor = self
            .opaque
            .executor
            .lock()
            .map_err(|e| Error::execution(format!("executor mutex poisoned: {e}")))?;

        executor
            .bind_input(slots::Q, q.device_ptr())
            .map_err(into_execution_error)?;
        executor
            .bind_input(slots::K, k.device_ptr())
            .map_err(into_execution_error)?;
        executor
            .bind_input(slots::V, v.device_ptr())
            .map_err(into_execution_error)?;
        if let Some(m) = mask {
            executor
                .bind_input(slots::MASK, m.device_ptr())
                .map_err(into_execution_error)?;
        }
        executor
            .bind_output(slots::SOFTMAX_MAX, softmax_max)
            .map_err(into_execution_error)?;
        executor
            .bind_output(slots::SOFTMAX_SUM, softmax_sum)
            .map_err(into_execution_error)?;
        executor
            .bind_output(slots::OUT, out.device_ptr_mut())
            .map_err(into_execution_error)?;

        log::trace!(
            "launching flash attention on {} with {workspace_size} B workspace",
            self.device
        );

        // SAFETY: every bound address comes from a buffer borrowed for this
        // call and checked against the sizes the plan was built for; the
        // workspace covers `workspace_size` bytes and is borrowed mutably.
        unsafe { executor.launch(ws, workspace_size, stream) }.map_err(into_execution_error)
    }

    pub fn shape(&self) -> &AttentionShape {
        &self.shape
    }

    pub fn params(&self) -> &FlashAttentionParams {
        &self.params
    }

    pub fn workspace_layout(&self) -> &WorkspaceLayout {
        &self.workspace
    }

    /// Minimum workspace, in bytes, every `calculate` call requires.
    pub fn workspace_size(&self) -> usize {
        self.workspace.total_size()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Native descriptors in plan order: q, k, v, mask, softmax max, softmax sum, out.
    pub fn native_tensors(&self) -> NativeTensors<'_, B> {
        NativeTensors {
            q: &self.opaque.q,
            k: &self.opaque.k,
            v: &self.opaque.v,
            mask: self.opaque.mask.as_ref(),
            softmax_max: &self.opaque.softmax_max,
            softmax_sum: &self.opaque.softmax_sum,
            out: &self.opaque.out,
        }
    }
}

/// Borrowed view of a descriptor's native tensors.
pub struct NativeTensors<'a, B: OpBackend> {
    pub q: &'a B::NativeTensor,
    pub k: &'a B::NativeTensor,
    pub v: &'a B::NativeTensor,
    pub mask: Option<&'a B::NativeTensor>,
    pub softmax_max: &'a B::NativeTensor,
    pub softmax_sum: &'a B::NativeTensor,
    pub out: &'a B::NativeTensor,
}

fn check_len(arg: &'static str, got: usize, need: usize) -> Result<()> {
    if got < need {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("buffer holds {got} bytes, plan needs {need}"),
        });
    }
    Ok(())
}

fn offset(base: DevicePtr, bytes: usize) -> DevicePtr {
    base + bytes as DevicePtr
}

fn into_planning_error(err: Error) -> Error {
    match err {
        Error::BackendPlanningError { .. } => err,
        other => Error::planning(other.to_string()),
    }
}

fn into_execution_error(err: Error) -> Error {
    match err {
        Error::BackendExecutionError { .. } => err,
        other => Error::execution(other.to_string()),
    }
}
