//! Error types for hearth-rag.

use hearth_decode::GenerateError;
use hearth_engine::EngineError;
use hearth_store::StoreError;
use hearth_tokenizer::TokenizerError;

/// Result type for hearth-rag operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: query has {query}, chunk has {chunk}")]
    DimensionMismatch { query: usize, chunk: usize },

    #[error("empty message")]
    EmptyMessage,

    #[error("invalid chat config: {0}")]
    Config(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("tokenization error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("generation error: {0}")]
    Generate(#[from] GenerateError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("generation task failed: {0}")]
    Task(String),
}

impl RagError {
    pub fn is_identity_required(&self) -> bool {
        matches!(self, RagError::Store(StoreError::IdentityRequired))
    }
}
