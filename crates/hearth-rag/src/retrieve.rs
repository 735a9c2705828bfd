//! Nearest-chunk retrieval by cosine similarity.
//!
//! A linear scan over every chunk of every document. There is no index, so
//! cost grows with corpus size times embedding dimension.

use std::sync::Arc;

use hearth_store::{Chunk, CorpusStore, Document};
use tracing::debug;
use uuid::Uuid;

use crate::embed::Embedder;
use crate::{RagError, Result};

/// Returned in place of a passage when the corpus has no documents.
pub const NO_KNOWLEDGE_BASE: &str = "No knowledge base available.";

/// `dot(a, b) / (|a| * |b|)`, or negative infinity when either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(RagError::DimensionMismatch {
            query: a.len(),
            chunk: b.len(),
        });
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return Ok(f32::NEG_INFINITY);
    }
    Ok((dot / (na.sqrt() * nb.sqrt())) as f32)
}

/// A chunk together with its score.
#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub document: Uuid,
    pub chunk: &'a Chunk,
    pub similarity: f32,
}

/// Highest-scoring chunk across `documents`.
///
/// Ties keep the first chunk seen. `None` when no chunk scores above
/// negative infinity.
pub fn best_chunk<'a>(query: &[f32], documents: &'a [Document]) -> Result<Option<ScoredChunk<'a>>> {
    let mut best: Option<ScoredChunk<'a>> = None;
    let mut best_sim = f32::NEG_INFINITY;
    for doc in documents {
        for chunk in &doc.chunks {
            let similarity = cosine_similarity(query, &chunk.embedding)?;
            if similarity > best_sim {
                best_sim = similarity;
                best = Some(ScoredChunk {
                    document: doc.id,
                    chunk,
                    similarity,
                });
            }
        }
    }
    Ok(best)
}

/// Finds the passage most similar to a query.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Text of the best chunk in `documents`.
    ///
    /// [`NO_KNOWLEDGE_BASE`] for an empty slice, the empty string when no
    /// chunk is comparable.
    pub fn find_best_chunk_in(&self, query: &str, documents: &[Document]) -> Result<String> {
        if documents.is_empty() {
            return Ok(NO_KNOWLEDGE_BASE.to_string());
        }
        let embedding = self.embedder.embed(query)?;
        let best = best_chunk(&embedding, documents)?;
        match &best {
            Some(hit) => debug!(document = %hit.document, similarity = hit.similarity, "best chunk"),
            None => debug!("no comparable chunk"),
        }
        Ok(best.map(|hit| hit.chunk.text.clone()).unwrap_or_default())
    }

    /// Like [`Retriever::find_best_chunk_in`] over the whole corpus.
    pub async fn find_best_chunk(&self, query: &str, corpus: &dyn CorpusStore) -> Result<String> {
        let documents = corpus.list().await?;
        self.find_best_chunk_in(query, &documents)
    }
}
