//! # hearth-kv
//!
//! Key/value cache store for hearth.
//!
//! Holds exactly `2 × layers` cache entries, one [`KvSlot`] per
//! `(layer, key|value)` pair. Each forward pass hands back a fresh `present`
//! tensor per slot; [`KvCacheStore::update`] releases the slot's previous
//! tensor and installs the new one. This is the only place cache buffers are
//! freed during a generation.
//!
//! - **Reset**: [`KvCacheStore::reset`] disposes everything held and installs
//!   empty `[1, kv_heads, 0, head_dim]` placeholders. Run it before every new
//!   generation, otherwise the previous conversation leaks into the next.
//! - **Atomic update**: all incoming tensors are validated before any slot is
//!   touched. A rejected update leaves the store unchanged and frees the
//!   incoming tensors.
//! - **Dispose failures** are never fatal. They are logged and counted
//!   ([`KvCacheStore::dispose_failures`]).

use std::fmt;

use hearth_engine::{CacheSlot, EngineError, HostTensor, ModelConfig, PastKeyValues, Tensor};
use tracing::{debug, warn};

/// Shape of one cache tensor: `[1, heads, seq_len, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KvShape {
    pub heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

impl KvShape {
    pub fn new(heads: usize, seq_len: usize, head_dim: usize) -> Self {
        Self {
            heads,
            seq_len,
            head_dim,
        }
    }

    /// Parse a 4-d tensor shape with batch size 1.
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        match dims {
            [1, heads, seq_len, head_dim] => Some(Self::new(*heads, *seq_len, *head_dim)),
            _ => None,
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        vec![1, self.heads, self.seq_len, self.head_dim]
    }

    pub fn total_elements(&self) -> usize {
        self.heads * self.seq_len * self.head_dim
    }
}

impl fmt::Display for KvShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[1, heads:{}, seq:{}, dim:{}]",
            self.heads, self.seq_len, self.head_dim
        )
    }
}

/// Error type for KV cache operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("expected {expected} cache tensors, got {got}")]
    EntryCount { expected: usize, got: usize },

    #[error("cache slot {0} is out of range or repeated")]
    BadSlot(String),

    #[error("shape mismatch for {slot}: expected {expected}, got {got:?}")]
    ShapeMismatch {
        slot: String,
        expected: KvShape,
        got: Vec<usize>,
    },

    #[error("cache tensors disagree on sequence length: {first} vs {other}")]
    RaggedSeqLen { first: usize, other: usize },

    #[error("cache would shrink from {current} to {new} positions")]
    SeqLenRegressed { current: usize, new: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type KvResult<T> = Result<T, KvError>;

/// One cache entry with single-owner replace semantics.
#[derive(Debug)]
pub struct KvSlot {
    slot: CacheSlot,
    tensor: Option<Tensor>,
}

impl KvSlot {
    pub fn new(slot: CacheSlot, tensor: Tensor) -> Self {
        Self {
            slot,
            tensor: Some(tensor),
        }
    }

    pub fn slot(&self) -> CacheSlot {
        self.slot
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        self.tensor.as_ref()
    }

    pub fn seq_len(&self) -> usize {
        self.tensor.as_ref().and_then(Tensor::seq_len).unwrap_or(0)
    }

    /// Dispose the current tensor, then install `tensor`.
    ///
    /// The new tensor is installed even when disposal fails; the failure is
    /// returned so the caller can count it.
    pub fn replace(&mut self, tensor: Tensor) -> Result<(), EngineError> {
        let disposed = self.release();
        self.tensor = Some(tensor);
        disposed
    }

    /// Dispose the current tensor and leave the slot empty.
    pub fn release(&mut self) -> Result<(), EngineError> {
        match self.tensor.take() {
            Some(old) => old.dispose(),
            None => Ok(()),
        }
    }
}

/// Session-level cache: `2 × layers` slots in [`CacheSlot::index`] order.
#[derive(Debug)]
pub struct KvCacheStore {
    layers: usize,
    empty_shape: KvShape,
    slots: Vec<KvSlot>,
    dispose_failures: u64,
}

impl KvCacheStore {
    /// Create a store for `config`, already reset.
    pub fn new(config: &ModelConfig) -> Self {
        let [_, heads, _, head_dim] = config.empty_kv_shape();
        let layers = config.num_hidden_layers;
        let empty_shape = KvShape::new(heads, 0, head_dim);
        let slots = CacheSlot::all(layers)
            .map(|slot| KvSlot::new(slot, HostTensor::zeros(empty_shape.dims()).into()))
            .collect();
        Self {
            layers,
            empty_shape,
            slots,
            dispose_failures: 0,
        }
    }

    /// Dispose every held tensor and reinstall empty placeholders.
    pub fn reset(&mut self) {
        for kv in &mut self.slots {
            if let Err(e) = kv.replace(HostTensor::zeros(self.empty_shape.dims()).into()) {
                self.dispose_failures += 1;
                warn!(slot = %kv.slot.input_name(), error = %e, "failed to dispose cache tensor on reset");
            }
        }
        debug!(entries = self.slots.len(), "kv cache reset");
    }

    /// Install the `present` outputs of a forward pass.
    ///
    /// Expects one tensor per slot, all with the configured head layout and
    /// the same sequence length, not shorter than the current cache.
    pub fn update(&mut self, present: Vec<(CacheSlot, Tensor)>) -> KvResult<()> {
        if let Err(e) = self.validate(&present) {
            for (_, tensor) in present {
                if tensor.dispose().is_err() {
                    self.dispose_failures += 1;
                }
            }
            return Err(e);
        }

        for (slot, tensor) in present {
            let kv = &mut self.slots[slot.index()];
            if let Err(e) = kv.replace(tensor) {
                self.dispose_failures += 1;
                warn!(slot = %slot.input_name(), error = %e, "failed to dispose previous cache tensor");
            }
        }
        Ok(())
    }

    fn validate(&self, present: &[(CacheSlot, Tensor)]) -> KvResult<()> {
        if present.len() != self.slots.len() {
            return Err(KvError::EntryCount {
                expected: self.slots.len(),
                got: present.len(),
            });
        }

        let mut seen = vec![false; self.slots.len()];
        let mut seq_len = None;
        for (slot, tensor) in present {
            let idx = slot.index();
            if slot.layer >= self.layers || seen[idx] {
                return Err(KvError::BadSlot(slot.input_name().to_string()));
            }
            seen[idx] = true;

            let shape = KvShape::from_dims(tensor.shape())
                .filter(|s| s.heads == self.empty_shape.heads && s.head_dim == self.empty_shape.head_dim)
                .ok_or_else(|| KvError::ShapeMismatch {
                    slot: slot.output_name().to_string(),
                    expected: self.empty_shape,
                    got: tensor.shape().to_vec(),
                })?;

            match seq_len {
                None => seq_len = Some(shape.seq_len),
                Some(first) if first != shape.seq_len => {
                    return Err(KvError::RaggedSeqLen {
                        first,
                        other: shape.seq_len,
                    })
                }
                Some(_) => {}
            }
        }

        let new = seq_len.unwrap_or(0);
        let current = self.seq_len();
        if new < current {
            return Err(KvError::SeqLenRegressed { current, new });
        }
        Ok(())
    }

    /// Number of cache entries (always `2 × layers`).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len() == 0
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    /// Current cached sequence length. All slots agree.
    pub fn seq_len(&self) -> usize {
        self.slots.first().map(KvSlot::seq_len).unwrap_or(0)
    }

    pub fn slots(&self) -> &[KvSlot] {
        &self.slots
    }

    /// How many tensors failed to dispose over the store's lifetime.
    pub fn dispose_failures(&self) -> u64 {
        self.dispose_failures
    }

    /// Number of slots currently holding a device-resident tensor.
    pub fn device_resident(&self) -> usize {
        self.slots
            .iter()
            .filter(|kv| kv.tensor().is_some_and(Tensor::is_device))
            .count()
    }

    /// Bytes of key/value data currently cached.
    pub fn active_memory_bytes(&self) -> usize {
        let per_slot = KvShape {
            seq_len: self.seq_len(),
            ..self.empty_shape
        }
        .total_elements();
        per_slot * self.slots.len() * std::mem::size_of::<f32>()
    }
}

impl PastKeyValues for KvCacheStore {
    fn layers(&self) -> usize {
        self.layers
    }

    fn get(&self, slot: CacheSlot) -> Option<&Tensor> {
        if slot.layer >= self.layers {
            return None;
        }
        self.slots.get(slot.index()).and_then(KvSlot::tensor)
    }

    fn seq_len(&self) -> usize {
        KvCacheStore::seq_len(self)
    }
}

impl Drop for KvCacheStore {
    fn drop(&mut self) {
        for kv in &mut self.slots {
            if let Err(e) = kv.release() {
                warn!(slot = %kv.slot.input_name(), error = %e, "failed to dispose cache tensor on drop");
            }
        }
    }
}
