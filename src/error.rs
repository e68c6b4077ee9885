//! Error types for sentinel operations.
//!
//! Defines the error taxonomy shared by all subsystems:
//! - Task queue admission and lifecycle transitions
//! - Rate-limit and alert rule lookup
//! - Durable storage of queue snapshots and backups
//! - External service probes and reinitialization
//! - Recovery effects

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The pending set reached its configured maximum. Callers must shed or delay.
    #[error("Queue capacity exceeded: {max} pending tasks")]
    CapacityExceeded { max: usize },

    /// A transition was requested for a task that is unknown or not in flight.
    /// Signals a caller bug.
    #[error("Task {task_id} is not in flight (state: {state})")]
    InvalidState { task_id: Uuid, state: String },
}

impl QueueError {
    /// Returns true for errors that indicate a caller bug rather than load.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, QueueError::InvalidState { .. })
    }
}

/// Errors raised by the rate limiter.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("No rate limit rule registered for key '{0}'")]
    UnknownRule(String),

    #[error("Invalid rate limit rule for '{key}': {reason}")]
    InvalidRule { key: String, reason: String },
}

/// Durable storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("No valid backup available")]
    NoValidBackup,

    #[error("Collection '{0}' not found")]
    NotFound(String),
}

/// Transient failures talking to an external collaborator.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service '{service}' unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("Service '{service}' timed out after {after:?}")]
    Timeout { service: String, after: Duration },
}

/// Errors raised by the alert manager.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("No alert rule registered for type '{0}'")]
    UnknownRule(String),
}

/// Errors raised by recovery effects. Always caught by the scan loop.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Service '{0}' still unhealthy after reinitialization")]
    StillUnhealthy(String),

    #[error("Unknown service '{0}'")]
    UnknownService(String),
}
