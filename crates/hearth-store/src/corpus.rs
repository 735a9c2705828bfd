//! Imported documents.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::jsonl::JsonlFile;
use crate::{Document, Result};

/// The document corpus the retriever scans.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Every document in insertion order.
    async fn list(&self) -> Result<Vec<Document>>;

    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Insert, or replace the document with the same id in place.
    async fn put(&self, document: Document) -> Result<()>;

    /// Returns whether a document was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

fn upsert(documents: &mut Vec<Document>, document: Document) {
    match documents.iter_mut().find(|d| d.id == document.id) {
        Some(existing) => *existing = document,
        None => documents.push(document),
    }
}

fn remove(documents: &mut Vec<Document>, id: Uuid) -> bool {
    let before = documents.len();
    documents.retain(|d| d.id != id);
    documents.len() < before
}

/// Corpus held in memory only.
#[derive(Debug, Default)]
pub struct MemoryCorpusStore {
    documents: RwLock<Vec<Document>>,
}

impl MemoryCorpusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self {
            documents: RwLock::new(documents),
        }
    }
}

#[async_trait]
impl CorpusStore for MemoryCorpusStore {
    async fn list(&self) -> Result<Vec<Document>> {
        Ok(self.documents.read().await.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.read().await.iter().find(|d| d.id == id).cloned())
    }

    async fn put(&self, document: Document) -> Result<()> {
        upsert(&mut *self.documents.write().await, document);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(remove(&mut *self.documents.write().await, id))
    }
}

/// Corpus in a JSON-lines file, one document per line.
pub struct FileCorpusStore {
    file: JsonlFile<Document>,
}

impl FileCorpusStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            file: JsonlFile::open(path)?,
        })
    }
}

#[async_trait]
impl CorpusStore for FileCorpusStore {
    async fn list(&self) -> Result<Vec<Document>> {
        Ok(self.file.read().await.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.file.read().await.iter().find(|d| d.id == id).cloned())
    }

    async fn put(&self, document: Document) -> Result<()> {
        let id = document.id;
        let chunks = document.chunks.len();
        self.file.mutate(|docs| upsert(docs, document)).await?;
        debug!(%id, chunks, "document stored");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let removed = self.file.mutate(|docs| remove(docs, id)).await?;
        debug!(%id, removed, "document delete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Chunk;

    fn doc(text: &str) -> Document {
        Document::new(
            text,
            vec![Chunk {
                text: text.to_string(),
                embedding: vec![1.0, 0.0],
            }],
        )
    }

    #[tokio::test]
    async fn put_replaces_same_id_in_place() {
        let store = MemoryCorpusStore::new();
        let a = doc("a");
        let b = doc("b");
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        let mut a2 = a.clone();
        a2.content = "a2".into();
        store.put(a2.clone()).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all, vec![a2, b]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryCorpusStore::with_documents(vec![doc("x")]);
        let id = store.list().await.unwrap()[0].id;
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }
}
