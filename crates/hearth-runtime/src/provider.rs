//! Execution-provider selection.
//!
//! Provides:
//! - [`KernelOp`]: operations a provider must execute
//! - [`KernelMatrix`]: which ops each provider supports in this build
//! - [`ProviderSelector`]: picks the first usable provider from a preference list

use std::collections::HashMap;
use std::fmt;

use hearth_engine::ExecutionProvider;
use tracing::{debug, warn};

/// Operations the reference graph executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    Embedding,
    RmsNorm,
    Rope,
    Attention,
    MlpSwiGlu,
    Projection,
}

impl KernelOp {
    pub fn all() -> &'static [KernelOp] {
        &[
            KernelOp::Embedding,
            KernelOp::RmsNorm,
            KernelOp::Rope,
            KernelOp::Attention,
            KernelOp::MlpSwiGlu,
            KernelOp::Projection,
        ]
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelOp::Embedding => write!(f, "embedding"),
            KernelOp::RmsNorm => write!(f, "rms_norm"),
            KernelOp::Rope => write!(f, "rope"),
            KernelOp::Attention => write!(f, "attention"),
            KernelOp::MlpSwiGlu => write!(f, "mlp_swiglu"),
            KernelOp::Projection => write!(f, "projection"),
        }
    }
}

/// Errors from provider selection.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no execution provider in the preference list is usable")]
    NoneUsable,
    #[error("provider {provider} missing support for: {}", missing.iter().map(|o| o.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedOps {
        provider: ExecutionProvider,
        missing: Vec<KernelOp>,
    },
}

/// Kernel availability: `(provider, op) → supported`.
#[derive(Debug, Clone)]
pub struct KernelMatrix {
    support: HashMap<(ExecutionProvider, KernelOp), bool>,
}

impl KernelMatrix {
    /// Probe every provider. The CPU kernels cover every op; no GPU kernels
    /// are built into the reference backend.
    pub fn probe() -> Self {
        let mut support = HashMap::new();
        for &provider in ExecutionProvider::all() {
            for &op in KernelOp::all() {
                let supported = matches!(provider, ExecutionProvider::Cpu);
                support.insert((provider, op), supported);
            }
        }
        Self { support }
    }

    pub fn supports(&self, provider: ExecutionProvider, op: KernelOp) -> bool {
        self.support.get(&(provider, op)).copied().unwrap_or(false)
    }

    /// Ok if `provider` runs every op.
    pub fn validate(&self, provider: ExecutionProvider) -> Result<(), ProviderError> {
        let missing: Vec<KernelOp> = KernelOp::all()
            .iter()
            .filter(|&&op| !self.supports(provider, op))
            .copied()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::UnsupportedOps { provider, missing })
        }
    }
}

/// Chooses the provider a session will run on.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    active: ExecutionProvider,
    matrix: KernelMatrix,
}

impl ProviderSelector {
    /// Best available provider, preferring the GPU.
    pub fn auto() -> Result<Self, ProviderError> {
        Self::from_preference(&[ExecutionProvider::Gpu, ExecutionProvider::Cpu])
    }

    /// First provider in `preferred` that supports every op.
    pub fn from_preference(preferred: &[ExecutionProvider]) -> Result<Self, ProviderError> {
        let matrix = KernelMatrix::probe();
        for &provider in preferred {
            match matrix.validate(provider) {
                Ok(()) => {
                    debug!(%provider, "selected execution provider");
                    return Ok(Self {
                        active: provider,
                        matrix,
                    });
                }
                Err(e) => warn!(%provider, error = %e, "execution provider unusable, falling back"),
            }
        }
        Err(ProviderError::NoneUsable)
    }

    /// Force a specific provider.
    pub fn with_provider(provider: ExecutionProvider) -> Result<Self, ProviderError> {
        let matrix = KernelMatrix::probe();
        matrix.validate(provider)?;
        Ok(Self {
            active: provider,
            matrix,
        })
    }

    pub fn active(&self) -> ExecutionProvider {
        self.active
    }

    pub fn matrix(&self) -> &KernelMatrix {
        &self.matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_supports_every_op() {
        let matrix = KernelMatrix::probe();
        for &op in KernelOp::all() {
            assert!(matrix.supports(ExecutionProvider::Cpu, op));
        }
        assert!(matrix.validate(ExecutionProvider::Cpu).is_ok());
    }

    #[test]
    fn gpu_is_reported_with_missing_ops() {
        let err = KernelMatrix::probe()
            .validate(ExecutionProvider::Gpu)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gpu"));
        assert!(msg.contains("attention"));
    }

    #[test]
    fn auto_falls_back_to_cpu() {
        let selector = ProviderSelector::auto().unwrap();
        assert_eq!(selector.active(), ExecutionProvider::Cpu);
    }

    #[test]
    fn forcing_gpu_fails() {
        assert!(ProviderSelector::with_provider(ExecutionProvider::Gpu).is_err());
        assert!(matches!(
            ProviderSelector::from_preference(&[ExecutionProvider::Gpu]),
            Err(ProviderError::NoneUsable)
        ));
    }
}
