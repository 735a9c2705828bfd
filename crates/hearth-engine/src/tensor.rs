//! Host and device tensors.
//!
//! Only `f32` data is modelled. Shapes are row-major.

use tracing::warn;

use crate::memory::{BufferId, DeviceArena};
use crate::{EngineError, Result};

/// A tensor whose data lives in ordinary host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::shape(
                "host tensor",
                format!("{expected} elements for {shape:?}"),
                data.len(),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A tensor backed by a [`DeviceArena`] buffer.
///
/// Single owner: not `Clone`. Call [`DeviceTensor::dispose`] to free it; a
/// tensor dropped without disposal is released on a best-effort basis and a
/// warning is logged.
#[derive(Debug)]
pub struct DeviceTensor {
    id: BufferId,
    shape: Vec<usize>,
    arena: DeviceArena,
    released: bool,
}

impl DeviceTensor {
    pub(crate) fn new(id: BufferId, shape: Vec<usize>, arena: DeviceArena) -> Self {
        Self {
            id,
            shape,
            arena,
            released: false,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Download the buffer into a new host tensor.
    pub fn to_host(&self) -> Result<HostTensor> {
        let data = self.arena.read(self.id)?;
        HostTensor::new(self.shape.clone(), data)
    }

    /// Release the underlying buffer.
    pub fn dispose(mut self) -> Result<()> {
        self.released = true;
        self.arena.release(self.id)
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        if !self.released {
            warn!(buffer = %self.id, "device tensor dropped without dispose");
            let _ = self.arena.release(self.id);
        }
    }
}

/// Either kind of tensor, as carried in session inputs/outputs.
#[derive(Debug)]
pub enum Tensor {
    Host(HostTensor),
    Device(DeviceTensor),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Host(t) => t.shape(),
            Tensor::Device(t) => t.shape(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Tensor::Device(_))
    }

    /// Sequence axis of a `[batch, heads, seq, head_dim]` cache tensor.
    pub fn seq_len(&self) -> Option<usize> {
        match self.shape() {
            [_, _, seq, _] => Some(*seq),
            _ => None,
        }
    }

    /// Host copy of the data, downloading from the device if needed.
    pub fn to_host(&self) -> Result<HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t.clone()),
            Tensor::Device(t) => t.to_host(),
        }
    }

    /// Free device memory. Host tensors are simply dropped.
    pub fn dispose(self) -> Result<()> {
        match self {
            Tensor::Host(_) => Ok(()),
            Tensor::Device(t) => t.dispose(),
        }
    }
}

impl From<HostTensor> for Tensor {
    fn from(t: HostTensor) -> Self {
        Tensor::Host(t)
    }
}

impl From<DeviceTensor> for Tensor {
    fn from(t: DeviceTensor) -> Self {
        Tensor::Device(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_tensor_checks_len() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        // A zero-length axis holds no data.
        let empty = HostTensor::new(vec![1, 4, 0, 8], vec![]).unwrap();
        assert_eq!(empty.numel(), 0);
    }

    #[test]
    fn seq_len_reads_third_axis() {
        let t: Tensor = HostTensor::zeros(vec![1, 2, 5, 4]).into();
        assert_eq!(t.seq_len(), Some(5));
        let flat: Tensor = HostTensor::zeros(vec![3]).into();
        assert_eq!(flat.seq_len(), None);
    }

    #[test]
    fn device_round_trip_through_host() {
        let arena = DeviceArena::new();
        let t: Tensor = arena.upload(vec![1, 1, 1, 2], vec![3.0, 4.0]).unwrap().into();
        assert!(t.is_device());
        assert_eq!(t.to_host().unwrap().data(), &[3.0, 4.0]);
        t.dispose().unwrap();
        assert_eq!(arena.live_buffers(), 0);
    }

    #[test]
    fn dropped_device_tensor_is_reclaimed() {
        let arena = DeviceArena::new();
        {
            let _t = arena.upload(vec![4], vec![0.0; 4]).unwrap();
            assert_eq!(arena.live_buffers(), 1);
        }
        assert_eq!(arena.live_buffers(), 0);
    }
}
