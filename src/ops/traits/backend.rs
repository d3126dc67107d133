//! Backend capability traits
//!
//! Every accelerator binding implements these. Operator descriptors only talk
//! to a backend through them: dtype mapping, native descriptor creation, and
//! an [`Executor`] whose input/output slots are rebound to device addresses
//! before each launch.

use crate::dtype::DType;
use crate::error::Result;
use std::fmt;

/// Device address of a buffer, or of a byte offset inside one.
pub type DevicePtr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Npu,
}

/// Device a backend handle (and every plan it builds) is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: usize,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Npu => "npu",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

/// Memory the backend can hand to a kernel by address.
pub trait DeviceBuffer {
    /// Length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address for read-only use by a kernel.
    fn device_ptr(&self) -> DevicePtr;

    /// Address for kernel writes.
    fn device_ptr_mut(&mut self) -> DevicePtr;
}

/// A prepared execution plan.
///
/// Dropping an executor releases its backend resources.
pub trait Executor: Send {
    type Stream;

    /// Allow the plan to be launched more than once.
    fn set_repeatable(&mut self) -> Result<()>;

    fn is_repeatable(&self) -> bool;

    /// Point input `slot` at `ptr` for subsequent launches.
    fn bind_input(&mut self, slot: usize, ptr: DevicePtr) -> Result<()>;

    /// Point output `slot` at `ptr` for subsequent launches.
    fn bind_output(&mut self, slot: usize, ptr: DevicePtr) -> Result<()>;

    /// Submit the plan on `stream`.
    ///
    /// Returns once the work is enqueued; synchronous backends return after
    /// it has finished.
    ///
    /// # Safety
    ///
    /// Every bound slot and `workspace..workspace + workspace_size` must be
    /// live device memory of at least the size the plan was built for, and
    /// must stay live until the stream has executed the launch. Output
    /// regions must not be read or written by anything else in that window.
    unsafe fn launch(
        &mut self,
        workspace: DevicePtr,
        workspace_size: usize,
        stream: &Self::Stream,
    ) -> Result<()>;
}

/// Device/runtime surface shared by all operators.
pub trait OpBackend {
    /// Backend-native element type tag.
    type NativeDType: Copy + fmt::Debug + PartialEq;
    /// Backend-native tensor descriptor; no storage, released on drop.
    type NativeTensor: fmt::Debug + Send + Sync;
    type Buffer: DeviceBuffer;
    type Stream;
    type Executor: Executor<Stream = Self::Stream>;

    fn device(&self) -> Device;

    /// Map a semantic dtype to the native tag, or fail with `UnsupportedDType`.
    fn native_dtype(&self, dtype: DType) -> Result<Self::NativeDType>;

    /// Create a native descriptor of the given extents with no backing buffer.
    fn create_tensor(
        &self,
        dtype: Self::NativeDType,
        shape: &[usize],
    ) -> Result<Self::NativeTensor>;
}
