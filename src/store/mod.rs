//! Shared key-value store.
//!
//! The store is the only coordination medium between workers. It offers
//! plain get/set/delete with no compare-and-swap, so every protocol built on
//! it (leases, the task queue) is a read-modify-write that tolerates races
//! through timeouts rather than preventing them.

mod migrations;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

/// A key-value store visible to every worker on the device.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Read a key, falling back to `default` when it is absent.
    async fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }
}

/// Read and deserialize a JSON value.
///
/// # Errors
///
/// Returns an error if the store fails or the stored value is not valid JSON
/// for `T`.
pub async fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .with_context(|| format!("Corrupt value under key {key}")),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
///
/// # Errors
///
/// Returns an error if serialization or the store write fails.
pub async fn save_json<T: Serialize + Sync + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value).context("Failed to serialize store value")?;
    store.set(key, &raw).await
}

/// In-process store. Clones of an `Arc<MemoryStore>` behave like workers
/// sharing one device.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
