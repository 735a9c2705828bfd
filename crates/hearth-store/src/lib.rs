//! # hearth-store
//!
//! Persistence behind the chat orchestrator.
//!
//! - [`ChatHistoryStore`]: ordered chat turns per user
//! - [`CorpusStore`]: imported documents with their chunk embeddings
//! - [`IdentityStore`]: the configured user name
//!
//! Each comes with an in-memory implementation for tests and a file-backed
//! one. File stores keep everything in memory and rewrite their file on every
//! mutation; history and corpus are JSON-lines, identity is a small JSON
//! key/value file.

use std::path::{Path, PathBuf};

pub mod corpus;
pub mod error;
pub mod history;
pub mod identity;
mod jsonl;
pub mod types;

pub use corpus::{CorpusStore, FileCorpusStore, MemoryCorpusStore};
pub use error::{Result, StoreError};
pub use history::{ChatHistoryStore, FileChatStore, MemoryChatStore};
pub use identity::{resolve_identity, FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use types::{ChatTurn, Chunk, Document, UserId};

/// File names under a hearth home directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.hearth`, falling back to the working directory without a home.
    pub fn default_root() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".hearth")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.root.join("corpus.jsonl")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_live_under_root() {
        let layout = StoreLayout::new("/tmp/h");
        assert_eq!(layout.history_path(), PathBuf::from("/tmp/h/history.jsonl"));
        assert_eq!(layout.corpus_path(), PathBuf::from("/tmp/h/corpus.jsonl"));
        assert_eq!(layout.config_path(), PathBuf::from("/tmp/h/config.json"));
        assert_eq!(layout.model_dir(), PathBuf::from("/tmp/h/model"));
    }
}
