use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{StorageBackend, StorageError};

/// Journal storage persisted as a single JSON document.
///
/// Every mutation rewrites the document through a temporary file followed by
/// a rename, so a crash leaves either the old or the new snapshot on disk.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let entries = Self::load(&path);
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An unreadable snapshot starts an empty journal instead of failing startup.
    fn load(path: &Path) -> BTreeMap<String, String> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable journal snapshot");
                BTreeMap::new()
            }
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let snapshot = serde_json::to_vec(entries)?;
        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&snapshot).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(err) = self.persist(&entries).await {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
