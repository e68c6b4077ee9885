//! pipeline_sentinel: Resilient task-processing core for unattended content
//! pipelines.
//!
//! This library provides a priority task queue with retry and durable
//! snapshots, per-key rate limiting, health aggregation, threshold alerts
//! and cooldown-gated self-healing.

// Core modules
pub mod alerts;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod recovery;
pub mod sentinel;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, SentinelConfig};
pub use error::{AlertError, QueueError, RateLimitError, RecoveryError, ServiceError, StorageError};
pub use sentinel::{Sentinel, SentinelBuilder, SentinelError};
