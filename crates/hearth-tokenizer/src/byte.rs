//! Byte-level reference tokenizer.

use hearth_engine::TokenId;

use crate::{DecodingState, Tokenizer, TokenizerError, TokenizerResult};

/// Special tokens after the 256 byte ids, in id order.
pub const SPECIAL_TOKENS: [&str; 5] = [
    "<|endoftext|>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "<|end|>",
];

const BYTE_TOKENS: usize = 256;

enum Piece {
    Byte(u8),
    Special,
}

/// Every byte is its own token; chat markup maps to ids 256..=260.
///
/// - Deterministic, no vocabulary file
/// - `<|endoftext|>` (256) matches the tiny model's end-of-sequence id
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }

    fn piece(&self, token: TokenId) -> TokenizerResult<Piece> {
        let index = usize::try_from(token).map_err(|_| TokenizerError::InvalidToken(token))?;
        if index < BYTE_TOKENS {
            Ok(Piece::Byte(index as u8))
        } else if index < BYTE_TOKENS + SPECIAL_TOKENS.len() {
            Ok(Piece::Special)
        } else {
            Err(TokenizerError::InvalidToken(token))
        }
    }

    fn special_at(rest: &str) -> Option<(TokenId, usize)> {
        SPECIAL_TOKENS
            .iter()
            .position(|s| rest.starts_with(s))
            .map(|i| ((BYTE_TOKENS + i) as TokenId, SPECIAL_TOKENS[i].len()))
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'<' {
                // A '<' byte is always a char boundary.
                if let Some((id, len)) = Self::special_at(&text[i..]) {
                    ids.push(id);
                    i += len;
                    continue;
                }
            }
            ids.push(TokenId::from(bytes[i]));
            i += 1;
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            if let Piece::Byte(b) = self.piece(token)? {
                bytes.push(b);
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        let piece = self.piece(token)?;
        state.tokens.push(token);
        match piece {
            Piece::Byte(b) => {
                state.pending_utf8.push(b);
                Ok(state.drain_utf8())
            }
            Piece::Special => Ok(String::new()),
        }
    }

    fn vocab_size(&self) -> usize {
        BYTE_TOKENS + SPECIAL_TOKENS.len()
    }

    fn token_id(&self, token: &str) -> Option<TokenId> {
        SPECIAL_TOKENS
            .iter()
            .position(|s| *s == token)
            .map(|i| (BYTE_TOKENS + i) as TokenId)
    }

    fn is_byte_level(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ascii_as_bytes() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.encode("Hi").unwrap(), vec![72, 105]);
        assert!(tok.encode("").unwrap().is_empty());
    }

    #[test]
    fn encodes_chat_markup_as_specials() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("<|user|>a<|end|><|assistant|>").unwrap();
        assert_eq!(ids, vec![258, 97, 260, 259]);
    }

    #[test]
    fn unmatched_angle_bracket_is_a_byte() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.encode("<|x").unwrap(), vec![60, 124, 120]);
    }

    #[test]
    fn decode_skips_specials() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("<|system|>Grüße<|end|>").unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), "Grüße");
    }

    #[test]
    fn decode_rejects_out_of_range() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.decode(&[261]).unwrap_err(), TokenizerError::InvalidToken(261));
        assert_eq!(tok.decode(&[-1]).unwrap_err(), TokenizerError::InvalidToken(-1));
    }

    #[test]
    fn special_ids_resolve() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.token_id("<|endoftext|>"), Some(256));
        assert_eq!(tok.token_id("<|end|>"), Some(260));
        assert_eq!(tok.token_id("<|nope|>"), None);
        assert_eq!(tok.vocab_size(), 261);
    }
}
