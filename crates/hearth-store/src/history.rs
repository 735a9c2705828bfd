//! Per-user chat logs.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::jsonl::JsonlFile;
use crate::{ChatTurn, Result, UserId};

/// Ordered chat turns keyed by user.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Turns of `user` in insertion order; empty when there are none.
    async fn get(&self, user: &UserId) -> Result<Vec<ChatTurn>>;

    /// Append turns to the end of `user`'s log in one write.
    async fn append_all(&self, user: &UserId, turns: Vec<ChatTurn>) -> Result<()>;

    async fn append(&self, user: &UserId, turn: ChatTurn) -> Result<()> {
        self.append_all(user, vec![turn]).await
    }

    /// Drop `user`'s log.
    async fn clear(&self, user: &UserId) -> Result<()>;

    /// Drop every user's log.
    async fn clear_all(&self) -> Result<()>;
}

/// History held in memory only.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    logs: RwLock<HashMap<UserId, Vec<ChatTurn>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistoryStore for MemoryChatStore {
    async fn get(&self, user: &UserId) -> Result<Vec<ChatTurn>> {
        Ok(self.logs.read().await.get(user).cloned().unwrap_or_default())
    }

    async fn append_all(&self, user: &UserId, turns: Vec<ChatTurn>) -> Result<()> {
        self.logs
            .write()
            .await
            .entry(user.clone())
            .or_default()
            .extend(turns);
        Ok(())
    }

    async fn clear(&self, user: &UserId) -> Result<()> {
        self.logs.write().await.remove(user);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.logs.write().await.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryRecord {
    user: UserId,
    turn: ChatTurn,
}

/// History in a JSON-lines file, one `{user, turn}` record per line.
pub struct FileChatStore {
    file: JsonlFile<HistoryRecord>,
}

impl FileChatStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            file: JsonlFile::open(path)?,
        })
    }
}

#[async_trait]
impl ChatHistoryStore for FileChatStore {
    async fn get(&self, user: &UserId) -> Result<Vec<ChatTurn>> {
        Ok(self
            .file
            .read()
            .await
            .iter()
            .filter(|r| &r.user == user)
            .map(|r| r.turn.clone())
            .collect())
    }

    async fn append_all(&self, user: &UserId, turns: Vec<ChatTurn>) -> Result<()> {
        let count = turns.len();
        self.file
            .mutate(|records| {
                records.extend(turns.into_iter().map(|turn| HistoryRecord {
                    user: user.clone(),
                    turn,
                }))
            })
            .await?;
        debug!(%user, count, "chat turns appended");
        Ok(())
    }

    async fn clear(&self, user: &UserId) -> Result<()> {
        self.file
            .mutate(|records| records.retain(|r| &r.user != user))
            .await?;
        debug!(%user, path = %self.file.path().display(), "chat history cleared");
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.file.mutate(|records| records.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_store_keeps_order_per_user() {
        let store = MemoryChatStore::new();
        let u1 = UserId::new("u1").unwrap();
        let u2 = UserId::new("u2").unwrap();
        let t1 = ChatTurn::user("t1", Utc::now());
        let t2 = ChatTurn::assistant("t2", Utc::now());

        store.append(&u1, t1.clone()).await.unwrap();
        store.append(&u2, ChatTurn::user("other", Utc::now())).await.unwrap();
        store.append(&u1, t2.clone()).await.unwrap();

        assert_eq!(store.get(&u1).await.unwrap(), vec![t1, t2]);
        store.clear(&u1).await.unwrap();
        assert!(store.get(&u1).await.unwrap().is_empty());
        assert_eq!(store.get(&u2).await.unwrap().len(), 1);

        store.clear_all().await.unwrap();
        assert!(store.get(&u2).await.unwrap().is_empty());
    }
}
