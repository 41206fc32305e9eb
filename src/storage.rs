//! # Durable Key-Value Storage
//!
//! The delivery queue and the diagnostics log persist through the
//! [`KeyValueStore`] boundary. Both reads and writes can fail (quota, I/O,
//! corruption) and callers are expected to turn those failures into
//! diagnostics rather than propagate them.
//!
//! Two implementations are provided:
//!
//! - [`JsonFileStore`]: a single JSON object on disk, rewritten atomically
//! - [`MemoryStore`]: process-local map with failure injection for tests

use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the given keys; missing keys are simply absent from the result
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StorageError>;

    /// Insert or overwrite the given keys
    async fn set(&self, values: Map<String, Value>) -> Result<(), StorageError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// JSON object persisted to a single file
///
/// Writes go to a sibling temp file first and are renamed into place so a
/// crash mid-write never leaves a truncated state file behind.
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Map::new()),
            Ok(content) => Ok(serde_json::from_str::<Map<String, Value>>(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current contents for a read-modify-write
    ///
    /// A corrupt file is moved aside to `<name>.corrupt` and writing starts
    /// from an empty object, so one bad write cannot disable persistence.
    async fn read_for_write(&self) -> Result<Map<String, Value>, StorageError> {
        match self.read_all().await {
            Err(StorageError::Corrupt(e)) => {
                let quarantine = self.quarantine_path();
                tokio::fs::rename(&self.path, &quarantine).await?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %quarantine.display(),
                    error = %e,
                    "state file is corrupt, starting over"
                );
                Ok(Map::new())
            }
            other => other,
        }
    }

    pub fn quarantine_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec(map)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(path = %self.path.display(), bytes = content.len(), "state file written");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StorageError> {
        let _guard = self.lock.lock().await;
        let all = self.read_all().await?;
        Ok(keys
            .iter()
            .filter_map(|key| all.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    async fn set(&self, values: Map<String, Value>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_for_write().await?;
        all.extend(values);
        self.write_all(&all).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_for_write().await?;
        for key in keys {
            all.remove(*key);
        }
        self.write_all(&all).await
    }
}

/// In-memory store; reads and writes can be made to fail on demand
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<Map<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw value currently held under `key`
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.values.lock().ok().and_then(|values| values.get(key).cloned())
    }

    /// Overwrite a key without going through the failure switches
    pub fn seed(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated read failure".to_string()));
        }
        let values = self
            .values
            .lock()
            .map_err(|_| StorageError::Unavailable("store lock poisoned".to_string()))?;
        Ok(keys
            .iter()
            .filter_map(|key| values.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    async fn set(&self, new_values: Map<String, Value>) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded("simulated quota exceeded".to_string()));
        }
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::Unavailable("store lock poisoned".to_string()))?;
        values.extend(new_values);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded("simulated quota exceeded".to_string()));
        }
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::Unavailable("store lock poisoned".to_string()))?;
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn single(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = JsonFileStore::new(temp_dir.path().join("state.json"));

        let values = store.get(&["deliveryQueue"]).await.expect("read should succeed");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_set_get_remove() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = JsonFileStore::new(temp_dir.path().join("nested").join("state.json"));

        store.set(single("a", json!([1, 2]))).await.expect("write should succeed");
        store.set(single("b", json!({"x": true}))).await.expect("write should succeed");

        let values = store.get(&["a", "b", "c"]).await.expect("read should succeed");
        assert_eq!(values.get("a"), Some(&json!([1, 2])));
        assert_eq!(values.get("b"), Some(&json!({"x": true})));
        assert!(!values.contains_key("c"));

        store.remove(&["a"]).await.expect("remove should succeed");
        let values = store.get(&["a", "b"]).await.expect("read should succeed");
        assert!(!values.contains_key("a"));
        assert!(values.contains_key("b"));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_reports_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{not json").expect("Failed to write corrupt state");

        let store = JsonFileStore::new(&path);
        let result = store.get(&["a"]).await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_file_store_write_replaces_corrupt_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{ not json").expect("Failed to write corrupt state");

        let store = JsonFileStore::new(&path);
        store.set(single("a", json!(1))).await.expect("first write should heal the file");
        store.set(single("b", json!(2))).await.expect("second write should succeed");

        let reopened = JsonFileStore::new(&path);
        let values = reopened.get(&["a", "b"]).await.expect("read should succeed");
        assert_eq!(values.get("a"), Some(&json!(1)));
        assert_eq!(values.get("b"), Some(&json!(2)));

        let quarantined =
            std::fs::read_to_string(store.quarantine_path()).expect("corrupt file kept aside");
        assert_eq!(quarantined, "{ not json");
    }

    #[tokio::test]
    async fn test_file_store_non_object_is_corrupt() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "[1, 2, 3]").expect("Failed to write state");

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.get(&["a"]).await, Err(StorageError::Corrupt(_))));

        store.remove(&["a"]).await.expect("remove should heal the file");
        assert!(store.get(&["a"]).await.expect("read should succeed").is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set(single("k", json!(1))).await.expect("write should succeed");

        store.set_fail_writes(true);
        assert!(store.set(single("k", json!(2))).await.is_err());
        assert_eq!(store.peek("k"), Some(json!(1)));

        store.set_fail_reads(true);
        assert!(store.get(&["k"]).await.is_err());
    }
}
