//! The configured user name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Result, StoreError, UserId};

/// Config key the user name is stored under.
pub const USER_NAME_KEY: &str = "user_name";

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self) -> Result<Option<UserId>>;
    async fn set(&self, user: &UserId) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// Resolve the acting user: an explicit name wins, then the stored one.
///
/// Fails with [`StoreError::IdentityRequired`] when neither is present.
pub async fn resolve_identity(
    explicit: Option<&str>,
    store: &dyn IdentityStore,
) -> Result<UserId> {
    if let Some(name) = explicit.filter(|n| !n.trim().is_empty()) {
        return UserId::new(name);
    }
    store.get().await?.ok_or(StoreError::IdentityRequired)
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    user: RwLock<Option<UserId>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self) -> Result<Option<UserId>> {
        Ok(self.user.read().await.clone())
    }

    async fn set(&self, user: &UserId) -> Result<()> {
        *self.user.write().await = Some(user.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.user.write().await = None;
        Ok(())
    }
}

/// Identity kept in a JSON key/value config file.
///
/// Other keys in the file are preserved.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileIdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::io("read", &self.path, e)),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create", parent, e))?;
        }
        let text = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| StoreError::io("write", &self.path, e))
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get(&self) -> Result<Option<UserId>> {
        let _guard = self.lock.read().await;
        let entries = self.load().await?;
        Ok(entries
            .get(USER_NAME_KEY)
            .and_then(|name| UserId::new(name.as_str()).ok()))
    }

    async fn set(&self, user: &UserId) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut entries = self.load().await?;
        entries.insert(USER_NAME_KEY.to_string(), user.to_string());
        self.save(&entries).await?;
        debug!(%user, "identity stored");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut entries = self.load().await?;
        if entries.remove(USER_NAME_KEY).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}
