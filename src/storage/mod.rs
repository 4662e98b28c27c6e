//! Key/value backends behind the recovery journal.
//!
//! Storage on the client side may be cleared, quota-limited or missing
//! entirely, so every operation is fallible and callers decide how much of
//! that to tolerate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub mod file;

pub use file::FileStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage quota exceeded ({used} of {limit} bytes)")]
    QuotaExceeded { used: usize, limit: usize },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Keys starting with `prefix`, in lexical order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Process-local storage with an optional byte quota.
///
/// `set_available(false)` makes every call fail, the way private-mode storage
/// behaves once it has been revoked.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    store: Arc<RwLock<BTreeMap<String, String>>>,
    quota_bytes: Option<usize>,
    available: Arc<AtomicBool>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(BTreeMap::new())),
            quota_bytes: None,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("storage access denied".to_string()))
        }
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("storage lock poisoned".to_string())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        let store = self.store.read().map_err(|_| Self::poisoned())?;
        Ok(store.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut store = self.store.write().map_err(|_| Self::poisoned())?;
        if let Some(limit) = self.quota_bytes {
            let used: usize = store
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
                + key.len()
                + value.len();
            if used > limit {
                return Err(StorageError::QuotaExceeded { used, limit });
            }
        }
        store.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut store = self.store.write().map_err(|_| Self::poisoned())?;
        store.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_available()?;
        let store = self.store.read().map_err(|_| Self::poisoned())?;
        Ok(store
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let storage = InMemoryStorage::new();
        storage.set("a:1", "one").await.unwrap();
        storage.set("a:2", "two").await.unwrap();
        storage.set("b:1", "other").await.unwrap();

        assert_eq!(storage.get("a:1").await.unwrap().as_deref(), Some("one"));
        assert_eq!(storage.keys("a:").await.unwrap(), vec!["a:1", "a:2"]);

        storage.delete("a:1").await.unwrap();
        assert_eq!(storage.get("a:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn quota_rejects_oversized_writes() {
        let storage = InMemoryStorage::with_quota(16);
        storage.set("k", "small").await.unwrap();
        let err = storage.set("k2", "this value is far too long").await;
        assert!(matches!(err, Err(StorageError::QuotaExceeded { .. })));
        // overwriting an existing key only counts the new value
        storage.set("k", "smaller").await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_storage_fails_every_call() {
        let storage = InMemoryStorage::new();
        storage.set("k", "v").await.unwrap();
        storage.set_available(false);
        assert!(storage.get("k").await.is_err());
        assert!(storage.set("k", "v2").await.is_err());
        storage.set_available(true);
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
