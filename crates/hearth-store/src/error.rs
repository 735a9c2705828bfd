//! Error types for hearth-store.

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A persistence call was made without a resolved user identity.
    #[error("user identity required")]
    IdentityRequired,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(what: &str, path: &std::path::Path, err: std::io::Error) -> Self {
        StoreError::Storage(format!("failed to {what} {}: {err}", path.display()))
    }
}
