//! Host memory buffers for the host backend

use bytemuck::Pod;
use half::{bf16, f16};

use crate::ops::traits::backend::{DeviceBuffer, DevicePtr};

/// Byte buffer in host memory, addressed by kernels through its pointer.
///
/// Elements are stored in native byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBuffer {
    data: Vec<u8>,
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Copy a slice of plain-old-data elements.
    pub fn from_pod<T: Pod>(values: &[T]) -> Self {
        Self {
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_pod(values)
    }

    pub fn from_f16(values: &[f16]) -> Self {
        Self::from_pod(values)
    }

    pub fn from_bf16(values: &[bf16]) -> Self {
        Self::from_pod(values)
    }

    /// One byte per element, 1 for `true`.
    pub fn from_bools(values: &[bool]) -> Self {
        Self {
            data: values.iter().map(|&b| u8::from(b)).collect(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fill(&mut self, byte: u8) {
        self.data.fill(byte);
    }

    /// Copy out as `T`; a trailing partial element is ignored.
    ///
    /// The storage has byte alignment, so elements are copied rather than
    /// cast in place.
    pub fn to_pod_vec<T: Pod>(&self) -> Vec<T> {
        pod_vec(&self.data)
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.to_pod_vec()
    }

    pub fn to_f16_vec(&self) -> Vec<f16> {
        self.to_pod_vec()
    }

    pub fn to_bf16_vec(&self) -> Vec<bf16> {
        self.to_pod_vec()
    }

    /// `f32` view of `range` bytes, e.g. a statistics region of a workspace.
    pub fn f32_region(&self, range: std::ops::Range<usize>) -> Vec<f32> {
        pod_vec(&self.data[range])
    }
}

fn pod_vec<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
    bytemuck::pod_collect_to_vec(&bytes[..whole])
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn device_ptr(&self) -> DevicePtr {
        self.data.as_ptr() as DevicePtr
    }

    fn device_ptr_mut(&mut self) -> DevicePtr {
        self.data.as_mut_ptr() as DevicePtr
    }
}
