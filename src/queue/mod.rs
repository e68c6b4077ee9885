//! Priority task queue with retry lifecycle, durable persistence and a worker
//! pool.
//!
//! # Architecture
//!
//! ```text
//! producers ──enqueue──▶ TaskQueue ◀──dequeue/complete/fail── WorkerPool
//!                            │                                   │
//!                      snapshot/restore                   RateLimiter admission
//!                            ▼
//!                      QueueStorage ──▶ DurableStore (FileStore | MemoryStore)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pipeline_sentinel::queue::{EnqueueOptions, TaskPriority, TaskQueue};
//!
//! let queue = TaskQueue::default();
//! let id = queue.enqueue(
//!     "publish",
//!     serde_json::json!({"post": 42}),
//!     EnqueueOptions::new().with_priority(TaskPriority::High),
//! )?;
//! if let Some(task) = queue.dequeue_next() {
//!     queue.complete(task.id)?;
//! }
//! ```

pub mod storage;
pub mod store;
pub mod task;
pub mod task_queue;
pub mod worker_pool;

pub use storage::{
    compute_checksum, BackupEnvelope, QueueStorage, BACKUP_PREFIX, PROCESSING_COLLECTION,
    QUEUE_COLLECTION,
};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use task::{EnqueueOptions, Task, TaskPriority, TaskStatus};
pub use task_queue::{QueueConfig, QueueSnapshot, QueueStats, TaskQueue};
pub use worker_pool::{PoolError, PoolStats, TaskHandler, WorkerPool, WorkerPoolConfig};
