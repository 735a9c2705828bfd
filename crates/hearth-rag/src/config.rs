//! Configuration for the chat orchestrator.

use std::path::Path;

use hearth_decode::{StopConfig, PHI3_END, PHI3_END_OF_TEXT};
use hearth_engine::TokenId;
use serde::{Deserialize, Serialize};

use crate::import::DEFAULT_CHUNK_SIZE;
use crate::prompt::{PromptTemplates, DEFAULT_MARKER, DEFAULT_SYSTEM_WITHOUT_CONTEXT, DEFAULT_SYSTEM_WITH_CONTEXT};
use crate::{RagError, Result};

pub const DEFAULT_CHAT_MAX_TOKENS: usize = 300;
pub const DEFAULT_APOLOGY: &str = "There was a problem, please try again later.";
pub const DEFAULT_WELCOME: &str = "👋 Hello! I am your virtual assistant. How can I help you?";

/// Configuration for chat turns. Every field has a default, so a JSON file
/// may set any subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Total token budget, prompt included.
    pub max_tokens: usize,

    /// Answers are cut at this character. `None` disables truncation.
    pub marker: Option<char>,

    /// Turn-end token ids.
    pub stop_sentinels: Vec<TokenId>,

    /// Assistant text persisted when answering fails.
    pub apology: String,

    /// Shown for an empty history; never persisted.
    pub welcome: String,

    /// Character bound for packed import chunks.
    pub chunk_size: usize,

    pub system_with_context: String,
    pub system_without_context: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CHAT_MAX_TOKENS,
            marker: Some(DEFAULT_MARKER),
            stop_sentinels: vec![PHI3_END, PHI3_END_OF_TEXT],
            apology: DEFAULT_APOLOGY.to_string(),
            welcome: DEFAULT_WELCOME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            system_with_context: DEFAULT_SYSTEM_WITH_CONTEXT.to_string(),
            system_without_context: DEFAULT_SYSTEM_WITHOUT_CONTEXT.to_string(),
        }
    }
}

impl ChatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ChatConfig =
            serde_json::from_str(json).map_err(|e| RagError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RagError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RagError::Config("max_tokens must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(RagError::Config("chunk_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_marker(mut self, marker: Option<char>) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_stop_sentinels(mut self, sentinels: impl IntoIterator<Item = TokenId>) -> Self {
        self.stop_sentinels = sentinels.into_iter().collect();
        self
    }

    pub fn with_apology(mut self, text: impl Into<String>) -> Self {
        self.apology = text.into();
        self
    }

    pub fn with_welcome(mut self, text: impl Into<String>) -> Self {
        self.welcome = text.into();
        self
    }

    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn stop_config(&self) -> StopConfig {
        StopConfig::default()
            .with_sentinels(self.stop_sentinels.iter().copied())
            .with_max_tokens(self.max_tokens)
    }

    pub fn templates(&self) -> PromptTemplates {
        PromptTemplates {
            system_with_context: self.system_with_context.clone(),
            system_without_context: self.system_without_context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_chat_behavior() {
        let c = ChatConfig::default();
        assert_eq!(c.max_tokens, 300);
        assert_eq!(c.marker, Some('*'));
        assert_eq!(c.stop_sentinels, vec![32007, 32000]);
        assert_eq!(c.chunk_size, 1000);
        let stop = c.stop_config();
        assert_eq!(stop.max_tokens, 300);
        assert!(stop.is_sentinel(32007));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = ChatConfig::from_json(r#"{"max_tokens": 64, "marker": null}"#).unwrap();
        assert_eq!(c.max_tokens, 64);
        assert_eq!(c.marker, None);
        assert_eq!(c.apology, DEFAULT_APOLOGY);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(ChatConfig::from_json(r#"{"max_tokens": 0}"#).is_err());
        assert!(ChatConfig::from_json(r#"{"chunk_size": "big"}"#).is_err());
    }

    #[test]
    fn builders_override() {
        let c = ChatConfig::new()
            .with_max_tokens(10)
            .with_marker(None)
            .with_stop_sentinels([260])
            .with_apology("sorry")
            .with_welcome("hi")
            .with_chunk_size(50);
        assert_eq!(c.max_tokens, 10);
        assert_eq!(c.stop_sentinels, vec![260]);
        assert_eq!(c.apology, "sorry");
        assert_eq!(c.welcome, "hi");
        assert_eq!(c.chunk_size, 50);
    }
}
