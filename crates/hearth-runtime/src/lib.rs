//! # hearth-runtime
//!
//! Execution side of hearth: execution-provider selection, the CPU reference
//! [`CpuSession`] implementing [`hearth_engine::InferenceSession`], the
//! serialized graph format it loads, and telemetry hooks (TTFT, tok/s).

pub mod cpu;
pub mod graph;
pub mod ops;
pub mod provider;
pub mod telemetry;

pub use cpu::{CpuSession, SessionHandle};
pub use graph::{build_tiny_model, write_tiny_model, GraphHeader, ModelArtifacts, TinyModelSpec};
pub use provider::{KernelMatrix, KernelOp, ProviderError, ProviderSelector};
pub use telemetry::{InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook};
