//! # hearth-rag
//!
//! Retrieval-augmented chat for hearth.
//!
//! A chat turn embeds the question, picks the single most similar chunk of
//! the corpus, renders one of two Phi-3 prompt templates depending on whether
//! the corpus had anything, greedily generates within a token budget, and
//! decodes only the generated suffix. Failures become an apology that is
//! persisted like any answer.
//!
//! ```text
//! question ─▶ Retriever ─▶ PromptTemplates ─▶ Tokenizer ─▶ Decoder ─▶ answer
//!                 ▲                                                    │
//!            CorpusStore                                   ChatHistoryStore
//! ```

pub mod chat;
pub mod config;
pub mod embed;
pub mod error;
pub mod import;
pub mod prompt;
pub mod retrieve;

pub use chat::{Answer, ChatReply, ChatService};
pub use config::{ChatConfig, DEFAULT_APOLOGY, DEFAULT_CHAT_MAX_TOKENS, DEFAULT_WELCOME};
pub use embed::{Embedder, HashingEmbedder, DEFAULT_HASH_DIMENSION};
pub use error::{RagError, Result};
pub use import::{import_document, is_xml, TextChunker, DEFAULT_CHUNK_SIZE};
pub use prompt::{has_context, truncate_at_marker, PromptTemplates, DEFAULT_MARKER};
pub use retrieve::{best_chunk, cosine_similarity, Retriever, ScoredChunk, NO_KNOWLEDGE_BASE};
