//! Adapter over a Hugging Face `tokenizer.json`.

use std::path::Path;

use hearth_engine::TokenId;

use crate::{DecodingState, Tokenizer, TokenizerError, TokenizerResult};

/// Wraps [`tokenizers::Tokenizer`]. Ids cross the boundary as [`TokenId`].
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> TokenizerResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| TokenizerError::Load(format!("{}: {e}", path.display())))?;
        Ok(Self { inner })
    }

    fn to_u32(tokens: &[TokenId]) -> TokenizerResult<Vec<u32>> {
        tokens
            .iter()
            .map(|&t| u32::try_from(t).map_err(|_| TokenizerError::InvalidToken(t)))
            .collect()
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TokenizerError::EncodingError(e.to_string()))?;
        encoding
            .get_ids()
            .iter()
            .map(|&id| {
                TokenId::try_from(id)
                    .map_err(|_| TokenizerError::EncodingError(format!("token id {id} out of range")))
            })
            .collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let ids = Self::to_u32(tokens)?;
        self.inner
            .decode(&ids, true)
            .map_err(|e| TokenizerError::DecodingError(e.to_string()))
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        state.tokens.push(token);
        let text = self.decode(&state.tokens)?;
        // Hold back while the tail is an incomplete character or the prefix
        // was re-normalised.
        if text.ends_with(char::REPLACEMENT_CHARACTER) || !text.starts_with(state.buffer.as_str()) {
            return Ok(String::new());
        }
        let emitted = text[state.buffer.len()..].to_string();
        state.buffer = text;
        Ok(emitted)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn token_id(&self, token: &str) -> Option<TokenId> {
        self.inner
            .token_to_id(token)
            .and_then(|id| TokenId::try_from(id).ok())
    }
}
