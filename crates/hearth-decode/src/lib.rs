//! # hearth-decode
//!
//! Greedy autoregressive decoding over an [`InferenceSession`] and a
//! [`hearth_kv::KvCacheStore`].
//!
//! A generation primes the cache with one pass over the whole prompt, then
//! feeds back one token per pass. The next token is always the argmax of the
//! last position's logits. After each token the stop checks run in order:
//! cancellation, end-of-sequence, turn-end sentinel, token budget.
//!
//! Cancellation is cooperative: a [`CancellationToken`] is checked before each
//! pass and after each token, never during a pass.
//!
//! [`InferenceSession`]: hearth_engine::InferenceSession
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod decoder;
pub mod stop;

pub use decoder::{argmax_last, Decoder, Generation, GenerationReport};
pub use stop::{DecodeState, StopConfig, StopReason, DEFAULT_MAX_TOKENS, PHI3_END, PHI3_END_OF_TEXT};
pub use tokio_util::sync::CancellationToken;

use hearth_engine::EngineError;
use hearth_kv::KvError;

/// Errors that abort a generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("empty prompt")]
    EmptyPrompt,

    #[error("prompt of {prompt} tokens exceeds the budget of {budget}")]
    PromptTooLong { prompt: usize, budget: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("kv cache error: {0}")]
    Kv(#[from] KvError),
}

pub type Result<T> = std::result::Result<T, GenerateError>;
