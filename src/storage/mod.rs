//! Key-value persistence for settings and telemetry
//!
//! Both collaborators talk to a small async map interface so the logic on top
//! never cares whether values live in memory or on disk.

mod file;

pub use file::FileStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to access store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store contents: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Async key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the requested keys. Missing keys are simply absent from the map.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError>;

    /// Insert or overwrite every entry in `items`.
    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError>;

    /// Delete the given keys if present.
    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// In-process store, used by tests and short-lived embeddings
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let items = self.items.read().await;
        Ok(pick(&items, keys))
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        self.items.write().await.extend(items);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut items = self.items.write().await;
        for key in keys {
            items.remove(*key);
        }
        Ok(())
    }
}

pub(crate) fn pick(items: &HashMap<String, Value>, keys: &[&str]) -> HashMap<String, Value> {
    keys.iter()
        .filter_map(|key| items.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([
                ("model".to_string(), json!("openrouter/auto")),
                ("typingSpeed".to_string(), json!(30)),
            ]))
            .await
            .unwrap();

        let got = store.get(&["model", "apiKey"]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["model"], json!("openrouter/auto"));
    }

    #[tokio::test]
    async fn test_memory_store_remove() {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([("apiKey".to_string(), json!("sk-test"))]))
            .await
            .unwrap();
        store.remove(&["apiKey", "missing"]).await.unwrap();

        assert!(store.get(&["apiKey"]).await.unwrap().is_empty());
    }
}
