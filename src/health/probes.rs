//! Read-only views the health checker polls.
//!
//! The checker never holds concrete components, only these narrow traits, so
//! it cannot mutate what it inspects.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{RateLimitError, ServiceError, StorageError};
use crate::queue::{QueueStats, QueueStorage, TaskQueue};
use crate::rate_limit::{KeyStats, RateLimiter};

/// Source of queue counters.
pub trait QueueStatsSource: Send + Sync {
    fn queue_stats(&self) -> QueueStats;
}

impl QueueStatsSource for TaskQueue {
    fn queue_stats(&self) -> QueueStats {
        self.stats()
    }
}

/// Source of rate-limit budgets.
pub trait BudgetSource: Send + Sync {
    fn remaining(&self, key: &str) -> Result<u32, RateLimitError>;
    fn budget_stats(&self) -> Vec<KeyStats>;
}

impl BudgetSource for RateLimiter {
    fn remaining(&self, key: &str) -> Result<u32, RateLimitError> {
        RateLimiter::remaining(self, key)
    }

    fn budget_stats(&self) -> Vec<KeyStats> {
        self.all_stats()
    }
}

/// Round-trip check of durable storage.
#[async_trait]
pub trait StorageProbe: Send + Sync {
    async fn probe(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl StorageProbe for QueueStorage {
    async fn probe(&self) -> Result<(), StorageError> {
        QueueStorage::probe(self).await
    }
}

/// Client of an external collaborator, such as the publishing API.
#[async_trait]
pub trait ExternalService: Send + Sync {
    /// Name used as the health component key.
    fn name(&self) -> &str;

    /// Returns whether the service is ready to take calls.
    async fn check_health(&self) -> Result<bool, ServiceError>;

    /// Releases connections and client state.
    async fn teardown(&self) -> Result<(), ServiceError>;

    /// Rebuilds client state after `teardown`.
    async fn initialize(&self) -> Result<(), ServiceError>;
}

/// Process resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub uptime_secs: u64,
}

/// Source of resource usage samples.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceUsage, ServiceError>;
}

/// Samples host memory and CPU through `sysinfo`.
pub struct SystemSampler {
    system: Mutex<System>,
    started: Instant,
}

impl std::fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSampler")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceUsage, ServiceError> {
        let mut system = self.lock();
        system.refresh_memory();
        // CPU usage is measured between consecutive refreshes.
        system.refresh_cpu();

        let total = system.total_memory();
        if total == 0 {
            return Err(ServiceError::Unavailable {
                service: "system".to_string(),
                reason: "total memory reported as zero".to_string(),
            });
        }
        let used = system.used_memory();

        Ok(ResourceUsage {
            memory_used_bytes: used,
            memory_total_bytes: total,
            memory_percent: used as f64 / total as f64 * 100.0,
            cpu_percent: f64::from(system.global_cpu_info().cpu_usage()),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, MemoryStore};
    use std::sync::Arc;

    #[test]
    fn test_queue_stats_source() {
        let queue = TaskQueue::default();
        queue
            .enqueue("t", serde_json::Value::Null, EnqueueOptions::new())
            .expect("enqueue");
        let source: &dyn QueueStatsSource = &queue;
        assert_eq!(source.queue_stats().depth, 1);
    }

    #[test]
    fn test_budget_source() {
        let limiter = RateLimiter::with_default_rules();
        let source: &dyn BudgetSource = &limiter;
        assert_eq!(source.remaining("publish").expect("rule"), 300);
        assert!(source.remaining("missing").is_err());
        assert_eq!(source.budget_stats().len(), 3);
    }

    #[tokio::test]
    async fn test_storage_probe() {
        let storage = QueueStorage::new(Arc::new(MemoryStore::new()), 3);
        let probe: &dyn StorageProbe = &storage;
        assert!(probe.probe().await.is_ok());
    }

    #[test]
    fn test_system_sampler_reports_memory() {
        let sampler = SystemSampler::new();
        let usage = sampler.sample().expect("sample");
        assert!(usage.memory_total_bytes > 0);
        assert!((0.0..=100.0).contains(&usage.memory_percent));
    }
}
