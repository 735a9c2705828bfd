//! JSON-lines file kept mirrored in memory.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::{Result, StoreError};

pub(crate) struct JsonlFile<T> {
    path: PathBuf,
    entries: RwLock<Vec<T>>,
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync> JsonlFile<T> {
    /// Load entries from `path`. A missing file starts empty, corrupted lines
    /// are skipped.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = Self::load(&path)?;
        debug!(path = %path.display(), count = entries.len(), "jsonl store loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.entries.read().await
    }

    /// Apply `f` to a copy, rewrite the file, then publish the copy.
    ///
    /// The write lock is held throughout. A failed write leaves the
    /// in-memory entries untouched.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        let out = f(&mut next);
        self.flush(&next).await?;
        *entries = next;
        Ok(out)
    }

    fn load(path: &Path) -> Result<Vec<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("read", path, e)),
        };

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<T>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(path = %path.display(), line = n + 1, error = %e, "skipping corrupted entry");
                    None
                }
            })
            .collect())
    }

    async fn flush(&self, entries: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create", parent, e))?;
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::io("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io("replace", &self.path, e))?;
        Ok(())
    }
}
