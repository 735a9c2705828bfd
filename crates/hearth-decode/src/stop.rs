//! Stop conditions and decoder states.

use hearth_engine::TokenId;

/// Phi-3 `<|end|>`.
pub const PHI3_END: TokenId = 32007;
/// Phi-3 `<|endoftext|>`.
pub const PHI3_END_OF_TEXT: TokenId = 32000;

/// Token budget used when none is configured.
pub const DEFAULT_MAX_TOKENS: usize = 256;

/// When a generation stops, besides end-of-sequence and cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopConfig {
    /// Turn-end sentinels. Producing any of them ends the generation.
    pub sentinels: Vec<TokenId>,
    /// Maximum total length (prompt plus generated tokens).
    pub max_tokens: usize,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            sentinels: vec![PHI3_END, PHI3_END_OF_TEXT],
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl StopConfig {
    pub fn with_sentinels(mut self, sentinels: impl IntoIterator<Item = TokenId>) -> Self {
        self.sentinels = sentinels.into_iter().collect();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn is_sentinel(&self, token: TokenId) -> bool {
        self.sentinels.contains(&token)
    }
}

/// Why a generation reached [`DecodeState::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    Sentinel(TokenId),
    Budget,
}

/// Decoder loop state machine.
///
/// `Init → Primed → Stepping → Done | Aborted`. `Failed` is entered when a
/// forward pass errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    #[default]
    Init,
    /// Cache reset and full-prompt pass done.
    Primed,
    /// Single-token passes.
    Stepping,
    Done(StopReason),
    Aborted,
    Failed,
}

impl DecodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DecodeState::Done(_) | DecodeState::Aborted | DecodeState::Failed
        )
    }
}
