//! Key-value byte stores backing queue persistence.
//!
//! A store maps collection names to opaque byte blobs. [`FileStore`] keeps one
//! file per collection under a directory; [`MemoryStore`] keeps blobs in a map
//! and is used by tests and by the `check` command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::StorageError;

/// Durable key-value byte interface.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Writes `bytes` under `collection`, replacing any previous value.
    async fn save(&self, collection: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Reads the bytes stored under `collection`.
    ///
    /// Returns `StorageError::NotFound` if nothing is stored there.
    async fn load(&self, collection: &str) -> Result<Vec<u8>, StorageError>;

    /// Lists collection names starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Deletes a collection. Removing a missing collection is not an error.
    async fn remove(&self, collection: &str) -> Result<(), StorageError>;
}

const FILE_EXTENSION: &str = "json";

/// Store that keeps one JSON file per collection under a directory.
///
/// Writes go to a temporary file that is synced and renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `base_path`. The directory is created lazily.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", collection, FILE_EXTENSION))
    }

    async fn ensure_directory(&self) -> Result<(), StorageError> {
        if !fs::try_exists(&self.base_path).await? {
            fs::create_dir_all(&self.base_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn save(&self, collection: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ensure_directory().await?;

        let path = self.collection_path(collection);
        let tmp_path = path.with_extension(format!("{}.tmp", FILE_EXTENSION));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;

        tracing::trace!(
            collection = collection,
            bytes = bytes.len(),
            "Collection saved"
        );

        Ok(())
    }

    async fn load(&self, collection: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.collection_path(collection);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(collection.to_string())
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        if !fs::try_exists(&self.base_path).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(prefix) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn remove(&self, collection: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.collection_path(collection)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// In-memory store.
///
/// Writes can be made to fail on demand, which lets callers exercise storage
/// outage handling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `save` calls fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrites a collection without going through `save`.
    pub async fn put_raw(&self, collection: &str, bytes: Vec<u8>) {
        self.collections
            .write()
            .await
            .insert(collection.to_string(), bytes);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn save(&self, collection: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(
                "memory store writes disabled",
            )));
        }
        self.put_raw(collection, bytes.to_vec()).await;
        Ok(())
    }

    async fn load(&self, collection: &str) -> Result<Vec<u8>, StorageError> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(collection.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove(&self, collection: &str) -> Result<(), StorageError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }
}
