//! JSON file backed store

use super::{pick, KeyValueStore, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const STORE_FILE: &str = "store.json";

/// Persists every key in a single JSON object on disk.
///
/// Writes go through a temp file and a rename, so a crash mid-write leaves the
/// previous contents intact.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-merge-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    /// Store rooted in `data_dir` (the directory is created lazily on first write).
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STORE_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, Value>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, items: &HashMap<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(items)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let _guard = self.lock.lock().await;
        let items = self.read_all().await?;
        Ok(pick(&items, keys))
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.extend(items);
        self.write_all(&all).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        let before = all.len();
        for key in keys {
            all.remove(*key);
        }
        if all.len() != before {
            self.write_all(&all).await?;
        }
        Ok(())
    }
}
