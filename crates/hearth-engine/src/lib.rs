//! # hearth-engine
//!
//! The "narrow waist" of the hearth stack. Defines the [`InferenceSession`] trait
//! and the types every other crate speaks: token ids, the model side-config,
//! host/device tensors and the typed input/output names of a forward pass.
//! Backends can be swapped without changing the decoder or the orchestrator.
//!
//! ## Design Notes
//!
//! ### Typed tensor names
//! Graph inputs and outputs are addressed through closed enums ([`InputName`],
//! [`OutputName`]) indexed by layer. The string forms (`past_key_values.3.key`,
//! `present.3.key`) exist only for display and logging.
//!
//! ### Device buffers
//! A [`DeviceTensor`] is neither `Clone` nor `Copy`. Whoever holds it owns the
//! underlying [`DeviceArena`] buffer and must call [`DeviceTensor::dispose`].
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod io;
pub mod memory;
pub mod tensor;

pub use config::ModelConfig;
pub use io::{CacheSlot, InputName, KvKind, OutputName, PastKeyValues, SessionInputs, SessionOutputs};
pub use memory::{BufferId, DeviceArena};
pub use tensor::{DeviceTensor, HostTensor, Tensor};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Top-level error type for all engine operations.
///
/// `Load`, `Io` and `Json` are load-time failures; everything else is raised by
/// a forward pass.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model loading failed: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("shape mismatch for {name}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("device allocation failed: {0}")]
    Allocation(String),

    #[error("non-finite logit {value} at vocabulary index {index}")]
    NonFiniteLogit { index: usize, value: f32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error happened while loading artifacts or config.
    pub fn is_load(&self) -> bool {
        matches!(
            self,
            EngineError::Load(_) | EngineError::Io(_) | EngineError::Json(_)
        )
    }

    /// Whether this error happened during a forward pass.
    pub fn is_inference(&self) -> bool {
        !self.is_load()
    }

    /// Shorthand for [`EngineError::ShapeMismatch`].
    pub fn shape(name: impl ToString, expected: impl ToString, got: impl ToString) -> Self {
        EngineError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// Where a session leaves its `present` key/value outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputLocation {
    /// Outputs are plain host vectors; dropping them frees them.
    #[default]
    Host,
    /// Outputs stay in device memory; the caller owns and must dispose them.
    Device,
}

/// Hardware a session executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Gpu,
}

impl ExecutionProvider {
    pub fn all() -> &'static [ExecutionProvider] {
        &[ExecutionProvider::Cpu, ExecutionProvider::Gpu]
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionProvider::Cpu => write!(f, "cpu"),
            ExecutionProvider::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ExecutionProvider::Cpu),
            "gpu" => Ok(ExecutionProvider::Gpu),
            other => Err(EngineError::Load(format!("unknown execution provider '{other}'"))),
        }
    }
}

/// Options fixed at session load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub provider: ExecutionProvider,
    pub output_location: OutputLocation,
    /// Record per-run timings and suppress streaming of partial output.
    pub profiling: bool,
}

impl SessionOptions {
    pub fn with_provider(mut self, provider: ExecutionProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_output_location(mut self, location: OutputLocation) -> Self {
        self.output_location = location;
        self
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }
}

/// A loaded model graph that can run forward passes.
///
/// Sessions are immutable after load apart from backend bookkeeping
/// (profiling counters, device arena). They are intentionally not `Clone`:
/// a session owns device memory.
pub trait InferenceSession: Send {
    /// The side-config the session was loaded with.
    fn config(&self) -> &ModelConfig;

    /// Options the session was loaded with.
    fn options(&self) -> &SessionOptions;

    /// Whether the graph takes a `position_ids` input.
    fn needs_position_ids(&self) -> bool {
        true
    }

    /// Run one forward pass.
    ///
    /// With [`OutputLocation::Device`] the `present` tensors in the result are
    /// device-resident and disposal passes to the caller.
    fn run(&mut self, inputs: SessionInputs<'_>) -> Result<SessionOutputs>;

    /// Flush profiling data. No-op unless the session was loaded with profiling.
    fn end_profiling(&mut self) {}

    /// Release everything the session owns. Later runs fail.
    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: InferenceSession + ?Sized> InferenceSession for Box<S> {
    fn config(&self) -> &ModelConfig {
        (**self).config()
    }

    fn options(&self) -> &SessionOptions {
        (**self).options()
    }

    fn needs_position_ids(&self) -> bool {
        (**self).needs_position_ids()
    }

    fn run(&mut self, inputs: SessionInputs<'_>) -> Result<SessionOutputs> {
        (**self).run(inputs)
    }

    fn end_profiling(&mut self) {
        (**self).end_profiling()
    }

    fn dispose(&mut self) -> Result<()> {
        (**self).dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(EngineError::Load("bad".into()).is_load());
        assert!(EngineError::Json(serde_json::from_str::<u8>("x").unwrap_err()).is_load());
        assert!(EngineError::Inference("boom".into()).is_inference());
        assert!(EngineError::NonFiniteLogit { index: 3, value: f32::NAN }.is_inference());
    }

    #[test]
    fn error_display_carries_context() {
        let err = EngineError::shape("input_ids", "[1, 4]", "[1, 3]");
        let msg = err.to_string();
        assert!(msg.contains("input_ids"));
        assert!(msg.contains("[1, 4]"));
    }

    #[test]
    fn session_options_builder() {
        let opts = SessionOptions::default()
            .with_output_location(OutputLocation::Device)
            .with_profiling(true);
        assert_eq!(opts.output_location, OutputLocation::Device);
        assert!(opts.profiling);
        assert_eq!(SessionOptions::default().output_location, OutputLocation::Host);
        assert_eq!(SessionOptions::default().provider, ExecutionProvider::Cpu);
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("GPU".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::Gpu);
        assert_eq!(ExecutionProvider::Cpu.to_string(), "cpu");
        assert!("tpu".parse::<ExecutionProvider>().unwrap_err().is_load());
    }
}
