//! Document import: chunking and embedding.
//!
//! XML documents are split on their `<norm>` elements. Anything else is
//! split into blank-line separated paragraphs, cleaned, and packed greedily
//! into chunks shorter than the chunk size.

use hearth_store::{Chunk, Document};
use regex::Regex;
use tracing::info;

use crate::embed::Embedder;
use crate::{RagError, Result};

/// Characters per chunk a packed chunk stays below.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Whether `text` is an XML document.
pub fn is_xml(text: &str) -> bool {
    text.trim_start().starts_with("<?xml")
}

/// Splits documents into retrievable chunks.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    norm: Regex,
    tag: Regex,
    numeric_entity: Regex,
    whitespace: Regex,
    blank_line: Regex,
}

impl TextChunker {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Config("chunk size must be non-zero".into()));
        }
        Ok(Self {
            chunk_size,
            // Self-closing `<norm/>` has no content and must not open a match.
            norm: Regex::new(r"(?s)<norm\b(?:[^>]*[^>/])?>(.*?)</norm>")?,
            tag: Regex::new(r"<[^>]*>")?,
            numeric_entity: Regex::new(r"&#\d+;")?,
            whitespace: Regex::new(r"\s+")?,
            blank_line: Regex::new(r"\n\s*\n")?,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks of `text`, XML or plain.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if is_xml(text) {
            self.split_xml(text)
        } else {
            self.split_paragraphs(text)
        }
    }

    /// Text content of every non-empty `<norm>` element.
    pub fn split_xml(&self, xml: &str) -> Vec<String> {
        self.norm
            .captures_iter(xml)
            .filter_map(|caps| caps.get(1))
            .map(|inner| decode_entities(&self.tag.replace_all(inner.as_str(), "")))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect()
    }

    /// NBSP and numeric entities to spaces, whitespace runs collapsed, trimmed.
    pub fn clean(&self, text: &str) -> String {
        let text = text.replace('\u{a0}', " ");
        let text = self.numeric_entity.replace_all(&text, " ");
        self.whitespace.replace_all(&text, " ").trim().to_string()
    }

    /// Greedily pack cleaned paragraphs.
    ///
    /// A paragraph joins the current chunk while the two together stay below
    /// the chunk size. A single oversized paragraph becomes its own chunk.
    pub fn split_paragraphs(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;
        for para in self.blank_line.split(text) {
            let para = self.clean(para);
            if para.is_empty() {
                continue;
            }
            let para_chars = para.chars().count();
            if current_chars + para_chars < self.chunk_size {
                current.push_str(&para);
                current.push_str("\n\n");
                current_chars += para_chars + 2;
            } else {
                if !current.trim().is_empty() {
                    chunks.push(current.trim().to_string());
                }
                current = format!("{para}\n\n");
                current_chars = para_chars + 2;
            }
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }
        chunks
    }

    /// Chunk and embed `text` into a new document that keeps the full text.
    pub fn import(&self, text: &str, embedder: &dyn Embedder) -> Result<Document> {
        let xml = is_xml(text);
        let pieces = self.chunk(text);
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let embeddings = embedder.embed_batch(&refs)?;
        if embeddings.len() != pieces.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                pieces.len(),
                embeddings.len()
            )));
        }
        let chunks = pieces
            .into_iter()
            .zip(embeddings)
            .map(|(text, embedding)| Chunk { text, embedding })
            .collect::<Vec<_>>();
        let document = Document::new(text, chunks);
        info!(
            id = %document.id,
            xml,
            chunks = document.chunks.len(),
            "document imported"
        );
        Ok(document)
    }
}

/// Import `text` with the default chunk size.
pub fn import_document(text: &str, embedder: &dyn Embedder) -> Result<Document> {
    TextChunker::new(DEFAULT_CHUNK_SIZE)?.import(text, embedder)
}

fn decode_entities(text: &str) -> String {
    // &amp; last so "&amp;lt;" stays "&lt;".
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
