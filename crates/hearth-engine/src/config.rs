//! Model side-config.
//!
//! Loaded from the `config.json` that ships next to the serialized graph. Only
//! the fields the decoder and KV cache need are required; head dim is derived.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result, TokenId};

/// Hyperparameters of a decoder-only transformer graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// End-of-sequence token id.
    pub eos_token_id: TokenId,

    /// Number of transformer layers.
    pub num_hidden_layers: usize,

    /// Number of key/value heads (GQA); fewer than query heads shrinks the cache.
    pub num_key_value_heads: usize,

    /// Hidden dimension of the model.
    pub hidden_size: usize,

    /// Number of query attention heads.
    pub num_attention_heads: usize,

    /// Vocabulary size, when the config carries it.
    #[serde(default)]
    pub vocab_size: Option<usize>,

    /// Context window of the graph.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl ModelConfig {
    /// Parse and validate a config from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(json)
            .map_err(|e| EngineError::Load(format!("invalid model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a `config.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Load(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Reject configs that cannot describe a real graph.
    pub fn validate(&self) -> Result<()> {
        if self.num_hidden_layers == 0 {
            return Err(EngineError::Load("num_hidden_layers must be > 0".into()));
        }
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(EngineError::Load("attention head counts must be > 0".into()));
        }
        if self.hidden_size == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(EngineError::Load(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(EngineError::Load(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.eos_token_id < 0 {
            return Err(EngineError::Load(format!(
                "eos_token_id {} is negative",
                self.eos_token_id
            )));
        }
        Ok(())
    }

    /// Dimension of each attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of query heads sharing one KV head.
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Shape of an empty per-layer cache tensor: `[1, kv_heads, 0, head_dim]`.
    pub fn empty_kv_shape(&self) -> [usize; 4] {
        [1, self.num_key_value_heads, 0, self.head_dim()]
    }

    /// Number of KV-cache entries (one key and one value per layer).
    pub fn kv_entry_count(&self) -> usize {
        2 * self.num_hidden_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHI3_MINI: &str = r#"{
        "eos_token_id": 32000,
        "num_hidden_layers": 32,
        "num_key_value_heads": 32,
        "hidden_size": 3072,
        "num_attention_heads": 32,
        "vocab_size": 32064
    }"#;

    #[test]
    fn parses_and_derives_head_dim() {
        let config = ModelConfig::from_json(PHI3_MINI).unwrap();
        assert_eq!(config.eos_token_id, 32000);
        assert_eq!(config.head_dim(), 96);
        assert_eq!(config.empty_kv_shape(), [1, 32, 0, 96]);
        assert_eq!(config.kv_entry_count(), 64);
        assert_eq!(config.max_position_embeddings, 4096);
    }

    #[test]
    fn missing_field_is_load_error() {
        let err = ModelConfig::from_json(r#"{"eos_token_id": 2}"#).unwrap_err();
        assert!(err.is_load());
        assert!(err.to_string().contains("invalid model config"));
    }

    #[test]
    fn indivisible_hidden_size_rejected() {
        let json = r#"{"eos_token_id": 2, "num_hidden_layers": 1, "num_key_value_heads": 1,
                       "hidden_size": 10, "num_attention_heads": 4}"#;
        assert!(ModelConfig::from_json(json).unwrap_err().is_load());
    }

    #[test]
    fn gqa_ratio_must_divide() {
        let json = r#"{"eos_token_id": 2, "num_hidden_layers": 1, "num_key_value_heads": 3,
                       "hidden_size": 16, "num_attention_heads": 4}"#;
        assert!(ModelConfig::from_json(json).is_err());
    }

    #[test]
    fn load_missing_file_is_load_error() {
        let err = ModelConfig::load(Path::new("/nonexistent/hearth/config.json")).unwrap_err();
        assert!(err.is_load());
    }
}
