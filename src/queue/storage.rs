//! Durable snapshot and restore of queue state.
//!
//! Queue state is kept in two collections of a [`DurableStore`]:
//!
//! - `queue`: the pending set
//! - `processing`: the in-flight set
//!
//! A save that stops part way may leave a task in both collections. Loads
//! keep the newest copy of each task.
//!
//! Timestamped backups (`backup_<timestamp>`) wrap both lists in an envelope
//! carrying a SHA-256 checksum of the serialized payload. A backup is only
//! activated after its checksum and structure have been verified.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::store::DurableStore;
use super::task::{Task, TaskStatus};
use super::task_queue::{QueueSnapshot, TaskQueue};
use crate::error::StorageError;

/// Collection holding the pending set.
pub const QUEUE_COLLECTION: &str = "queue";
/// Collection holding the in-flight set.
pub const PROCESSING_COLLECTION: &str = "processing";
/// Prefix shared by backup collections.
pub const BACKUP_PREFIX: &str = "backup_";
const PROBE_COLLECTION: &str = "health_probe";

/// Splits the stored tasks into pending and in-flight lists, one copy per id.
///
/// When an id appears more than once the copy with the newest `updated_at`
/// wins, and the in-flight copy wins a tie. Each surviving task is routed by
/// its status. Pending tasks keep their stored order.
fn reconcile(queue: Vec<Task>, processing: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    let mut newest: HashMap<Uuid, Task> = HashMap::new();
    let mut order = Vec::new();
    for task in processing.into_iter().chain(queue) {
        match newest.get(&task.id) {
            Some(kept) if kept.updated_at >= task.updated_at => {}
            Some(_) => {
                newest.insert(task.id, task);
            }
            None => {
                order.push(task.id);
                newest.insert(task.id, task);
            }
        }
    }

    let (mut pending, mut in_flight) = (Vec::new(), Vec::new());
    for id in order {
        if let Some(task) = newest.remove(&id) {
            if task.status == TaskStatus::Processing {
                in_flight.push(task);
            } else {
                pending.push(task);
            }
        }
    }
    (pending, in_flight)
}

/// On-disk format of a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEnvelope {
    /// When the backup was written.
    pub created_at: DateTime<Utc>,
    /// Hex-encoded SHA-256 of `payload`.
    pub checksum: String,
    /// Serialized [`QueueSnapshot`].
    pub payload: String,
}

impl BackupEnvelope {
    fn seal(snapshot: &QueueSnapshot, created_at: DateTime<Utc>) -> Result<Self, StorageError> {
        let payload = serde_json::to_string(snapshot)?;
        Ok(Self {
            created_at,
            checksum: compute_checksum(payload.as_bytes()),
            payload,
        })
    }

    /// Verifies the checksum and structure, returning the contained snapshot.
    pub fn open(&self) -> Result<QueueSnapshot, StorageError> {
        let actual = compute_checksum(self.payload.as_bytes());
        if actual != self.checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }

        let snapshot: QueueSnapshot = serde_json::from_str(&self.payload)?;
        snapshot.validate().map_err(StorageError::InvalidSnapshot)?;
        Ok(snapshot)
    }
}

/// Computes the hex-encoded SHA-256 of `data`.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Persists queue state to a [`DurableStore`].
#[derive(Clone)]
pub struct QueueStorage {
    store: Arc<dyn DurableStore>,
    max_backups: usize,
}

impl std::fmt::Debug for QueueStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStorage")
            .field("max_backups", &self.max_backups)
            .finish_non_exhaustive()
    }
}

impl QueueStorage {
    /// Creates storage over `store`, keeping at most `max_backups` backups.
    pub fn new(store: Arc<dyn DurableStore>, max_backups: usize) -> Self {
        Self { store, max_backups }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    async fn save_tasks(&self, collection: &str, tasks: &[Task]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(tasks)?;
        self.store.save(collection, &bytes).await?;
        tracing::debug!(collection = collection, tasks = tasks.len(), "Tasks saved");
        Ok(())
    }

    async fn load_tasks(&self, collection: &str) -> Result<Vec<Task>, StorageError> {
        match self.store.load(collection).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(StorageError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Writes the pending set.
    pub async fn save_queue(&self, pending: &[Task]) -> Result<(), StorageError> {
        self.save_tasks(QUEUE_COLLECTION, pending).await
    }

    /// Reads the pending set. A missing collection reads as empty.
    pub async fn load_queue(&self) -> Result<Vec<Task>, StorageError> {
        self.load_tasks(QUEUE_COLLECTION).await
    }

    /// Writes the in-flight set.
    pub async fn save_processing(&self, in_flight: &[Task]) -> Result<(), StorageError> {
        self.save_tasks(PROCESSING_COLLECTION, in_flight).await
    }

    /// Reads the in-flight set. A missing collection reads as empty.
    pub async fn load_processing(&self) -> Result<Vec<Task>, StorageError> {
        self.load_tasks(PROCESSING_COLLECTION).await
    }

    /// Writes both collections from a snapshot.
    ///
    /// `queue` is written twice, first holding every live task and last
    /// holding only the pending set. A save cut short at any step leaves a
    /// task in both collections rather than in neither.
    pub async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), StorageError> {
        let live: Vec<Task> = snapshot
            .pending
            .iter()
            .chain(&snapshot.in_flight)
            .cloned()
            .collect();
        self.save_queue(&live).await?;
        self.save_processing(&snapshot.in_flight).await?;
        self.save_queue(&snapshot.pending).await
    }

    /// Reads both collections and merges them with [`reconcile`].
    async fn load_merged(&self, taken_at: DateTime<Utc>) -> Result<QueueSnapshot, StorageError> {
        let (pending, in_flight) = reconcile(self.load_queue().await?, self.load_processing().await?);
        Ok(QueueSnapshot::new(taken_at, pending, in_flight))
    }

    /// Reads both collections and validates them as one snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidSnapshot` if the stored state is
    /// structurally inconsistent.
    pub async fn load_snapshot(&self) -> Result<QueueSnapshot, StorageError> {
        let snapshot = self.load_merged(Utc::now()).await?;
        snapshot.validate().map_err(StorageError::InvalidSnapshot)?;
        Ok(snapshot)
    }

    /// Snapshots the live queue into both collections.
    pub async fn persist(&self, queue: &TaskQueue) -> Result<QueueSnapshot, StorageError> {
        let snapshot = queue.snapshot();
        self.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Copies the stored collections into a new backup and prunes old ones.
    ///
    /// Returns the backup name.
    pub async fn create_backup(&self) -> Result<String, StorageError> {
        self.create_backup_at(Utc::now()).await
    }

    /// Creates a backup stamped with `now`.
    pub async fn create_backup_at(&self, now: DateTime<Utc>) -> Result<String, StorageError> {
        let snapshot = self.load_merged(now).await?;
        let envelope = BackupEnvelope::seal(&snapshot, now)?;
        let name = format!("{}{}", BACKUP_PREFIX, now.format("%Y%m%dT%H%M%S%.6fZ"));

        self.store
            .save(&name, &serde_json::to_vec(&envelope)?)
            .await?;

        let pruned = self.prune_backups(self.max_backups).await?;

        tracing::info!(
            backup = %name,
            tasks = snapshot.len(),
            pruned = pruned,
            "Queue backup created"
        );

        Ok(name)
    }

    /// Lists backup names, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<String>, StorageError> {
        self.store.list(BACKUP_PREFIX).await
    }

    /// Deletes the oldest backups so at most `keep` remain. Returns the number deleted.
    pub async fn prune_backups(&self, keep: usize) -> Result<usize, StorageError> {
        let backups = self.list_backups().await?;
        let excess = backups.len().saturating_sub(keep);

        for name in &backups[..excess] {
            self.store.remove(name).await?;
        }

        Ok(excess)
    }

    /// Reads and verifies one backup.
    pub async fn load_backup(&self, name: &str) -> Result<QueueSnapshot, StorageError> {
        let bytes = self.store.load(name).await?;
        let envelope: BackupEnvelope = serde_json::from_slice(&bytes)?;
        envelope.open()
    }

    /// Restores both collections from the newest backup that passes
    /// verification, trying older backups in turn.
    ///
    /// Returns the backup name and the activated snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NoValidBackup` if no backup verifies.
    pub async fn recover_from_backup(&self) -> Result<(String, QueueSnapshot), StorageError> {
        let backups = self.list_backups().await?;

        for name in backups.iter().rev() {
            match self.load_backup(name).await {
                Ok(snapshot) => {
                    self.save_snapshot(&snapshot).await?;
                    tracing::info!(
                        backup = %name,
                        tasks = snapshot.len(),
                        "Storage restored from backup"
                    );
                    return Ok((name.clone(), snapshot));
                }
                Err(e) => {
                    tracing::warn!(backup = %name, error = %e, "Skipping invalid backup");
                }
            }
        }

        Err(StorageError::NoValidBackup)
    }

    /// Empties both collections. Backups are kept.
    pub async fn clean(&self) -> Result<(), StorageError> {
        self.save_queue(&[]).await?;
        self.save_processing(&[]).await?;
        tracing::info!("Queue storage cleaned");
        Ok(())
    }

    /// Round-trips a small record through the store.
    pub async fn probe(&self) -> Result<(), StorageError> {
        let nonce = uuid::Uuid::new_v4().to_string();
        self.store.save(PROBE_COLLECTION, nonce.as_bytes()).await?;
        let read = self.store.load(PROBE_COLLECTION).await?;
        self.store.remove(PROBE_COLLECTION).await?;

        if read != nonce.as_bytes() {
            return Err(StorageError::ChecksumMismatch {
                expected: compute_checksum(nonce.as_bytes()),
                actual: compute_checksum(&read),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::{FileStore, MemoryStore};
    use crate::queue::task::{EnqueueOptions, TaskPriority, TaskStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn populated_queue() -> TaskQueue {
        let queue = TaskQueue::default();
        let now = Utc::now();
        queue
            .enqueue_at(
                "scrape",
                json!({"url": "https://example.com", "depth": 2}),
                EnqueueOptions::new().with_priority(TaskPriority::High),
                now,
            )
            .expect("enqueue");
        queue
            .enqueue_at(
                "publish",
                json!({"text": "hello"}),
                EnqueueOptions::new().with_not_before(now + chrono::Duration::minutes(5)),
                now,
            )
            .expect("enqueue");
        queue
            .enqueue_at("transform", json!(null), EnqueueOptions::new(), now)
            .expect("enqueue");
        let task = queue.dequeue_next_at(now).expect("eligible");
        queue.fail_at(task.id, "upstream 503", now).expect("fail");
        queue.dequeue_next_at(now).expect("eligible");
        queue
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_task_fields() {
        let dir = TempDir::new().expect("temp dir");
        let storage = QueueStorage::new(Arc::new(FileStore::new(dir.path())), 10);
        let queue = populated_queue();

        let saved = storage.persist(&queue).await.expect("persist");
        let loaded = storage.load_snapshot().await.expect("load");

        assert_eq!(loaded.pending, saved.pending);
        assert_eq!(loaded.in_flight, saved.in_flight);
        assert!(loaded
            .pending
            .iter()
            .any(|t| t.status == TaskStatus::Retrying && t.last_error.is_some()));
    }

    #[tokio::test]
    async fn test_missing_collections_read_empty() {
        let storage = QueueStorage::new(Arc::new(MemoryStore::new()), 10);
        let snapshot = storage.load_snapshot().await.expect("load");
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_backups_are_pruned() {
        let storage = QueueStorage::new(Arc::new(MemoryStore::new()), 2);
        storage.persist(&populated_queue()).await.expect("persist");

        let base = Utc::now();
        for i in 0..4 {
            storage
                .create_backup_at(base + chrono::Duration::seconds(i))
                .await
                .expect("backup");
        }

        let backups = storage.list_backups().await.expect("list");
        assert_eq!(backups.len(), 2);
        assert!(backups[0] < backups[1]);
    }

    #[tokio::test]
    async fn test_recover_skips_corrupt_newest_backup() {
        let store = Arc::new(MemoryStore::new());
        let storage = QueueStorage::new(store.clone(), 10);
        let queue = populated_queue();
        let saved = storage.persist(&queue).await.expect("persist");

        let base = Utc::now();
        let good = storage.create_backup_at(base).await.expect("backup");
        let bad = storage
            .create_backup_at(base + chrono::Duration::seconds(1))
            .await
            .expect("backup");

        let mut envelope: BackupEnvelope =
            serde_json::from_slice(&store.load(&bad).await.expect("load")).expect("envelope");
        envelope.payload.push(' ');
        store
            .put_raw(&bad, serde_json::to_vec(&envelope).expect("serialize"))
            .await;

        storage.clean().await.expect("clean");

        let (name, snapshot) = storage.recover_from_backup().await.expect("recover");
        assert_eq!(name, good);
        assert_eq!(snapshot.len(), saved.len());
        assert_eq!(storage.load_queue().await.expect("load").len(), saved.pending.len());
    }

    #[tokio::test]
    async fn test_interrupted_save_loses_no_task() {
        let storage = QueueStorage::new(Arc::new(MemoryStore::new()), 10);
        let queue = TaskQueue::default();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);

        let low = queue
            .enqueue_at("t", json!(null), EnqueueOptions::new().with_priority(TaskPriority::Low), now)
            .expect("enqueue");
        let high = queue
            .enqueue_at("t", json!(null), EnqueueOptions::new().with_priority(TaskPriority::High), now)
            .expect("enqueue");
        assert_eq!(queue.dequeue_next_at(now).map(|t| t.id), Some(high));
        storage.persist(&queue).await.expect("persist");

        // The high task goes back to pending and the low one moves in flight.
        queue.fail_at(high, "boom", later).expect("fail");
        assert_eq!(queue.dequeue_next_at(later).map(|t| t.id), Some(low));
        let current = queue.snapshot();
        let live: Vec<Task> = current
            .pending
            .iter()
            .chain(&current.in_flight)
            .cloned()
            .collect();

        // Stopped after the first write.
        storage.save_queue(&live).await.expect("save");
        let loaded = storage.load_snapshot().await.expect("load");
        assert_eq!(loaded.pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![high]);
        assert_eq!(loaded.in_flight.iter().map(|t| t.id).collect::<Vec<_>>(), vec![low]);
        assert_eq!(loaded.pending[0].status, TaskStatus::Retrying);

        // Stopped after the second write.
        storage.save_processing(&current.in_flight).await.expect("save");
        let loaded = storage.load_snapshot().await.expect("load");
        assert_eq!(loaded.pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![high]);
        assert_eq!(loaded.in_flight.iter().map(|t| t.id).collect::<Vec<_>>(), vec![low]);
    }

    #[tokio::test]
    async fn test_backup_rejects_invalid_structure() {
        let store = Arc::new(MemoryStore::new());
        let storage = QueueStorage::new(store.clone(), 10);

        let now = Utc::now();
        let mut task = Task::new("t", json!(null), TaskPriority::Low, 1, now);
        task.attempts = 4;
        let snapshot = QueueSnapshot::new(now, vec![task], vec![]);
        let envelope = BackupEnvelope::seal(&snapshot, now).expect("seal");
        store
            .put_raw("backup_1", serde_json::to_vec(&envelope).expect("serialize"))
            .await;

        assert!(matches!(
            storage.load_backup("backup_1").await,
            Err(StorageError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            storage.recover_from_backup().await,
            Err(StorageError::NoValidBackup)
        ));
    }

    #[tokio::test]
    async fn test_probe_reports_write_failure() {
        let store = Arc::new(MemoryStore::new());
        let storage = QueueStorage::new(store.clone(), 10);
        assert!(storage.probe().await.is_ok());

        store.set_fail_writes(true);
        assert!(storage.probe().await.is_err());
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
        assert_eq!(compute_checksum(b"").len(), 64);
    }
}
