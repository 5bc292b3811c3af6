//! Key-value storage backends for persisted identity state.
//!
//! The identity subsystem only needs a scoped get/set/delete interface over
//! JSON values. Two backends are provided:
//!
//! - [`MemoryStore`] keeps values in memory (tests, ephemeral sessions)
//! - [`FileStore`] persists each key as a `<key>.json` file in a directory
//!
//! Callers treat read and parse failures as "absent" and fall back to
//! regeneration, so backends only report what went wrong.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Async interface to the persistent key-value store.
///
/// Setting a key to JSON `null` removes it, so a missing key and a key set
/// to `null` are indistinguishable to readers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend identifier used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Load the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory key-value store.
///
/// Fast but not persistent across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            return self.delete(key).await;
        }
        self.values
            .write()
            .await
            .insert(key.to_owned(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// File-based key-value store.
///
/// Each key is written to `<base_path>/<key>.json`. Writes go through a
/// temporary file and a rename so a crash never leaves half a record.
#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a file store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Directory holding the stored values.
    #[must_use]
    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace([':', '/', '\\', '.'], "_");
        self.base_path.join(format!("{safe_key}.json"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| Error::storage("file", format!("create {}: {e}", self.base_path.display())))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.value_path(key);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage("file", format!("read {}: {e}", path.display()))),
        };

        let value: Value = serde_json::from_str(&content)?;
        debug!(key = %key, "loaded value from file");
        Ok((!value.is_null()).then_some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            return self.delete(key).await;
        }
        self.ensure_dir().await?;

        let path = self.value_path(key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)?;

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Error::storage("file", format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage("file", format!("rename {}: {e}", path.display())))?;

        debug!(key = %key, "saved value to file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.value_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "deleted value file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage("file", format!("delete {}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();

        store.set("hdkey_seed", &json!("abc")).await.unwrap();
        assert_eq!(store.get("hdkey_seed").await.unwrap(), Some(json!("abc")));

        store.set("hdkey_seed", &Value::Null).await.unwrap();
        assert!(store.get("hdkey_seed").await.unwrap().is_none());

        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state"));

        assert!(store.get("persona_keys").await.unwrap().is_none());

        let value = json!({"num": 1, "info": []});
        store.set("persona_keys", &value).await.unwrap();
        assert_eq!(store.get("persona_keys").await.unwrap(), Some(value));
        assert!(dir.path().join("state/persona_keys.json").exists());

        store.delete("persona_keys").await.unwrap();
        assert!(store.get("persona_keys").await.unwrap().is_none());
        store.delete("persona_keys").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        tokio::fs::write(dir.path().join("hdkey_seed.json"), "{not json")
            .await
            .unwrap();

        assert!(matches!(store.get("hdkey_seed").await, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.set("../escape", &json!(1)).await.unwrap();
        assert!(dir.path().join("___escape.json").exists());
    }
}
