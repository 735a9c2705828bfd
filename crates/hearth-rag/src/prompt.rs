//! Phi-3 chat prompts and answer post-processing.

use crate::retrieve::NO_KNOWLEDGE_BASE;

/// Character the generated answer is cut at.
pub const DEFAULT_MARKER: char = '*';

pub const DEFAULT_SYSTEM_WITH_CONTEXT: &str = "You are a helpful assistant. Answer the user's question briefly and precisely, and summarize the context in only a few sentences without repetition.";

pub const DEFAULT_SYSTEM_WITHOUT_CONTEXT: &str = "You are a helpful assistant. Answer based solely on the question and do not make up information when no context is available.";

/// Whether retrieval produced a passage rather than the empty-corpus sentinel.
pub fn has_context(retrieved: &str) -> bool {
    retrieved.trim() != NO_KNOWLEDGE_BASE
}

/// The two fixed chat templates.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    pub system_with_context: String,
    pub system_without_context: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_with_context: DEFAULT_SYSTEM_WITH_CONTEXT.to_string(),
            system_without_context: DEFAULT_SYSTEM_WITHOUT_CONTEXT.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Prompt for `question`, selected solely by whether `retrieved` is the
    /// empty-corpus sentinel.
    pub fn render(&self, question: &str, retrieved: &str) -> String {
        if has_context(retrieved) {
            format!(
                "<|system|>{}<|end|><|user|>Question: {question}\nContext: {retrieved}<|end|><|assistant|>",
                self.system_with_context
            )
        } else {
            format!(
                "<|system|>{}<|end|><|user|>Question: {question}<|end|><|assistant|>",
                self.system_without_context
            )
        }
    }
}

/// Cut `text` at the first `marker` and trim what remains.
///
/// Text without the marker is returned unchanged.
// Works around the model trailing its answer with markdown lists and notes.
pub fn truncate_at_marker(text: &str, marker: Option<char>) -> String {
    match marker.and_then(|m| text.find(m)) {
        Some(idx) => text[..idx].trim().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_selects_no_context_template() {
        let t = PromptTemplates::default();
        let p = t.render("What is X?", NO_KNOWLEDGE_BASE);
        assert!(p.starts_with("<|system|>You are a helpful assistant. Answer based solely"));
        assert!(p.ends_with("<|user|>Question: What is X?<|end|><|assistant|>"));
        assert!(!p.contains("Context:"));
    }

    #[test]
    fn passage_selects_context_template() {
        let t = PromptTemplates::default();
        let p = t.render("What is X?", "Par. 5 regulates X.");
        assert!(p.contains("<|user|>Question: What is X?\nContext: Par. 5 regulates X.<|end|>"));
        assert!(p.ends_with("<|assistant|>"));
    }

    #[test]
    fn empty_retrieval_still_counts_as_context() {
        assert!(has_context(""));
        assert!(!has_context("  No knowledge base available. "));
    }

    #[test]
    fn truncation_cuts_and_trims() {
        assert_eq!(truncate_at_marker("Answer. *Note", Some('*')), "Answer.");
        assert_eq!(truncate_at_marker("  keep as is ", Some('*')), "  keep as is ");
        assert_eq!(truncate_at_marker("*", Some('*')), "");
        assert_eq!(truncate_at_marker("a*b", None), "a*b");
    }
}
