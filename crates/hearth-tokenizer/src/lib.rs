//! # hearth-tokenizer
//!
//! The tokenizer boundary of hearth.
//!
//! - [`Tokenizer`]: `encode(text) -> ids`, `decode(ids) -> text`, plus
//!   streaming decode that holds back incomplete UTF-8
//! - [`ByteTokenizer`]: byte-level reference tokenizer that understands the
//!   Phi-3 chat markup, paired with the tiny CPU model
//! - `HfTokenizer` (feature `hf`): adapter over a Hugging Face `tokenizer.json`
//!
//! Encode and decode are deterministic but not exact inverses: decoding skips
//! special tokens.

use std::path::Path;

use hearth_engine::TokenId;
use tracing::debug;

mod byte;
#[cfg(feature = "hf")]
mod hf;

pub use byte::{ByteTokenizer, SPECIAL_TOKENS};
#[cfg(feature = "hf")]
pub use hf::HfTokenizer;

/// File name looked up by [`load_tokenizer`].
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("failed to load tokenizer: {0}")]
    Load(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs. Chat markup becomes special tokens.
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>>;

    /// Decode a complete sequence of tokens into text, skipping special tokens.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String>;

    /// Decode one more token of a stream.
    ///
    /// Returns the newly printable text, which may be empty while a multi-byte
    /// character is still incomplete.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Id of a special token given its text, e.g. `<|end|>`.
    fn token_id(&self, token: &str) -> Option<TokenId>;

    /// Whether every byte of input becomes its own token.
    fn is_byte_level(&self) -> bool {
        false
    }
}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    pending_utf8: Vec<u8>,
    tokens: Vec<TokenId>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Tokens fed so far.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Whether bytes of an incomplete character are held back.
    pub fn has_pending(&self) -> bool {
        !self.pending_utf8.is_empty()
    }

    /// Flush held-back bytes lossily, e.g. at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        self.buffer.push_str(&rest);
        rest
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
        self.tokens.clear();
    }

    /// Emit the longest decodable prefix of the pending bytes.
    ///
    /// Invalid sequences become U+FFFD. A truncated trailing sequence waits
    /// for more bytes.
    fn drain_utf8(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_utf8[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        self.buffer.push_str(&out);
        out
    }
}

/// Load the tokenizer that belongs to a model directory.
///
/// Uses `tokenizer.json` when present and the `hf` feature is enabled,
/// otherwise the byte-level tokenizer.
pub fn load_tokenizer(dir: &Path) -> TokenizerResult<Box<dyn Tokenizer>> {
    let path = dir.join(TOKENIZER_FILE);
    if path.exists() {
        #[cfg(feature = "hf")]
        {
            debug!(path = %path.display(), "loading tokenizer.json");
            return Ok(Box::new(HfTokenizer::from_file(&path)?));
        }
        #[cfg(not(feature = "hf"))]
        tracing::warn!(
            path = %path.display(),
            "built without the `hf` feature, ignoring tokenizer.json"
        );
    }
    debug!(dir = %dir.display(), "using byte-level tokenizer");
    Ok(Box::new(ByteTokenizer::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_holds_back_incomplete_sequence() {
        let mut state = DecodingState::new();
        // "é" is 0xC3 0xA9.
        state.pending_utf8.push(0xC3);
        assert_eq!(state.drain_utf8(), "");
        assert!(state.has_pending());
        state.pending_utf8.push(0xA9);
        assert_eq!(state.drain_utf8(), "é");
        assert!(!state.has_pending());
        assert_eq!(state.buffer(), "é");
    }

    #[test]
    fn drain_replaces_invalid_bytes() {
        let mut state = DecodingState::new();
        state.pending_utf8.extend_from_slice(&[b'a', 0xFF, b'b']);
        assert_eq!(state.drain_utf8(), "a\u{FFFD}b");
    }

    #[test]
    fn finish_flushes_lossily() {
        let mut state = DecodingState::new();
        state.pending_utf8.push(0xE2);
        assert_eq!(state.drain_utf8(), "");
        assert_eq!(state.finish(), "\u{FFFD}");
        assert!(!state.has_pending());
    }

    #[test]
    fn clear_resets_everything() {
        let mut state = DecodingState::new();
        state.pending_utf8.push(0xC3);
        state.tokens.push(1);
        state.buffer.push('x');
        state.clear();
        assert_eq!(state.buffer(), "");
        assert!(state.tokens().is_empty());
        assert!(!state.has_pending());
    }
}
