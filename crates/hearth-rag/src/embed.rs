//! Text embedders.

use crate::{RagError, Result};

/// Maps text to a fixed-length vector. Deterministic for a given model.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

/// Default vector length of [`HashingEmbedder`].
pub const DEFAULT_HASH_DIMENSION: usize = 256;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// Signed feature hashing of lower-cased word unigrams, L2-normalised.
///
/// Needs no model files. Texts sharing words get a positive cosine; text
/// without any word embeds to the zero vector.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Embedding("dimension must be non-zero".into()));
        }
        Ok(Self { dimension })
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_HASH_DIMENSION,
        }
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let h = fnv1a(word.as_bytes());
            let index = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[index] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_normalised() {
        let e = HashingEmbedder::default();
        let a = e.embed("Paragraph 5 regulates X").unwrap();
        let b = e.embed("Paragraph 5 regulates X").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_HASH_DIMENSION);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn case_and_punctuation_insensitive() {
        let e = HashingEmbedder::default();
        assert_eq!(e.embed("Hello, World!").unwrap(), e.embed("hello world").unwrap());
    }

    #[test]
    fn wordless_text_is_zero() {
        let e = HashingEmbedder::new(8).unwrap();
        assert!(e.embed(" ,.;").unwrap().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn batch_matches_single() {
        let e = HashingEmbedder::new(16).unwrap();
        let batch = e.embed_batch(&["a b", "c"]).unwrap();
        assert_eq!(batch[0], e.embed("a b").unwrap());
        assert_eq!(batch[1], e.embed("c").unwrap());
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }
}
