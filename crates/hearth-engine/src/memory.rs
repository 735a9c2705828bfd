//! Simulated accelerator memory.
//!
//! A [`DeviceArena`] stands in for GPU buffer memory: uploads hand out
//! single-owner [`DeviceTensor`]s and every buffer must be released exactly once.
//! Releasing an unknown or already released buffer is an error, which is how
//! double frees surface in tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::tensor::DeviceTensor;
use crate::{EngineError, Result};

/// Opaque id of a buffer inside a [`DeviceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct ArenaState {
    buffers: HashMap<BufferId, Vec<f32>>,
    next_id: u64,
    live_bytes: usize,
    peak_bytes: usize,
    capacity: Option<usize>,
}

/// Shared handle to a pool of device buffers.
///
/// Cloning the handle shares the pool.
#[derive(Debug, Clone, Default)]
pub struct DeviceArena {
    state: Arc<Mutex<ArenaState>>,
}

impl DeviceArena {
    /// Unbounded arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena that refuses uploads past `bytes` of live memory.
    pub fn with_capacity(bytes: usize) -> Self {
        let arena = Self::default();
        if let Ok(mut state) = arena.state.lock() {
            state.capacity = Some(bytes);
        }
        arena
    }

    fn lock(&self) -> Result<MutexGuard<'_, ArenaState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Allocation("device arena lock poisoned".into()))
    }

    /// Copy `data` into a new device buffer.
    pub fn upload(&self, shape: Vec<usize>, data: Vec<f32>) -> Result<DeviceTensor> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::shape(
                "device upload",
                format!("{expected} elements for {shape:?}"),
                data.len(),
            ));
        }
        let bytes = data.len() * std::mem::size_of::<f32>();

        let mut state = self.lock()?;
        if let Some(capacity) = state.capacity {
            if state.live_bytes + bytes > capacity {
                return Err(EngineError::Allocation(format!(
                    "out of device memory: {} live + {bytes} requested > {capacity}",
                    state.live_bytes
                )));
            }
        }
        let id = BufferId(state.next_id);
        state.next_id += 1;
        state.buffers.insert(id, data);
        state.live_bytes += bytes;
        state.peak_bytes = state.peak_bytes.max(state.live_bytes);
        drop(state);

        Ok(DeviceTensor::new(id, shape, self.clone()))
    }

    /// Copy a buffer back to the host.
    pub fn read(&self, id: BufferId) -> Result<Vec<f32>> {
        let state = self.lock()?;
        state
            .buffers
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Allocation(format!("read of released buffer {id}")))
    }

    /// Free a buffer. Fails if `id` is not live.
    pub fn release(&self, id: BufferId) -> Result<()> {
        let mut state = self.lock()?;
        match state.buffers.remove(&id) {
            Some(data) => {
                state.live_bytes -= data.len() * std::mem::size_of::<f32>();
                Ok(())
            }
            None => Err(EngineError::Allocation(format!(
                "release of unknown or already released buffer {id}"
            ))),
        }
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    pub fn live_bytes(&self) -> usize {
        self.lock().map(|s| s.live_bytes).unwrap_or(0)
    }

    /// High-water mark of live bytes since creation.
    pub fn peak_bytes(&self) -> usize {
        self.lock().map(|s| s.peak_bytes).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_read_release() {
        let arena = DeviceArena::new();
        let t = arena.upload(vec![1, 2], vec![1.0, 2.0]).unwrap();
        assert_eq!(arena.live_buffers(), 1);
        assert_eq!(arena.live_bytes(), 8);
        assert_eq!(arena.read(t.id()).unwrap(), vec![1.0, 2.0]);

        t.dispose().unwrap();
        assert_eq!(arena.live_buffers(), 0);
        assert_eq!(arena.live_bytes(), 0);
        assert_eq!(arena.peak_bytes(), 8);
    }

    #[test]
    fn double_release_is_error() {
        let arena = DeviceArena::new();
        let t = arena.upload(vec![1], vec![0.5]).unwrap();
        let id = t.id();
        arena.release(id).unwrap();
        let err = arena.release(id).unwrap_err();
        assert!(matches!(err, EngineError::Allocation(_)));
        // The tensor's own dispose now fails too.
        assert!(t.dispose().is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let arena = DeviceArena::with_capacity(16);
        let a = arena.upload(vec![4], vec![0.0; 4]).unwrap();
        let err = arena.upload(vec![1], vec![0.0]).unwrap_err();
        assert!(err.to_string().contains("out of device memory"));
        a.dispose().unwrap();
        assert!(arena.upload(vec![1], vec![0.0]).is_ok());
    }

    #[test]
    fn upload_checks_element_count() {
        let arena = DeviceArena::new();
        assert!(matches!(
            arena.upload(vec![2, 2], vec![0.0; 3]),
            Err(EngineError::ShapeMismatch { .. })
        ));
        assert_eq!(arena.live_buffers(), 0);
    }
}
