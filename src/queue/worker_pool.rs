//! Worker pool that drains the task queue.
//!
//! Each worker runs as an independent async task. It pulls the next eligible
//! task, waits for rate-limit admission on the handler's key, runs the handler
//! under a timeout and reports the outcome back to the queue.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with a cancellation token
//! - Rate-limit admission before every external call
//! - Failure events fed to the alert manager
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::Task;
use super::task_queue::TaskQueue;
use crate::alerts::{AlertManager, AlertType};
use crate::metrics::MetricsCollector;
use crate::rate_limit::RateLimiter;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Type tag this handler serves.
    fn task_type(&self) -> &str;

    /// Rate-limit key to acquire before each call, if the handler calls an
    /// external service.
    fn rate_limit_key(&self) -> Option<&str> {
        None
    }

    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long to sleep when no task is eligible.
    pub poll_interval: Duration,
    /// Maximum time allowed for handling a single task.
    pub task_timeout: Duration,
    /// Maximum time to wait for rate-limit admission.
    pub admission_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_millis(500),
            task_timeout: Duration::from_secs(300),
            admission_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently handling a task.
    pub active_workers: usize,
    /// Tasks handled successfully.
    pub tasks_completed: u64,
    /// Handler attempts that failed, including ones that will be retried.
    pub tasks_failed: u64,
    /// Average handling duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts handled (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let total = completed + failed;

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: if total > 0 {
                Duration::from_millis(total_duration_ms / total)
            } else {
                Duration::ZERO
            },
        }
    }
}

/// Handlers by task type.
type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

/// Worker pool that manages multiple workers draining a [`TaskQueue`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimiter>,
    alerts: Option<Arc<AlertManager>>,
    handlers: Arc<HandlerMap>,
    cancel: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: Arc<TaskQueue>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            config,
            queue,
            limiter,
            alerts: None,
            handlers: Arc::new(HashMap::new()),
            cancel: CancellationToken::new(),
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Reports handler failures to `alerts`.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Registers a handler for its task type. Takes effect on the next
    /// `start`.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let mut handlers = (*self.handlers).clone();
        handlers.insert(handler.task_type().to_string(), handler);
        self.handlers = Arc::new(handlers);
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        self.cancel = CancellationToken::new();
        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                limiter: Arc::clone(&self.limiter),
                alerts: self.alerts.clone(),
                handlers: Arc::clone(&self.handlers),
                cancel: self.cancel.child_token(),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Signals every worker to stop and waits for them.
    ///
    /// A task being handled when the signal arrives is abandoned and stays
    /// PROCESSING, to be reclaimed on the next cold start.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.cancel.cancel();

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let joined = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, joined).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// A single worker that processes tasks from the queue.
struct Worker {
    id: String,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimiter>,
    alerts: Option<Arc<AlertManager>>,
    handlers: Arc<HandlerMap>,
    cancel: CancellationToken,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");

        while !self.cancel.is_cancelled() {
            let Some(task) = self.queue.dequeue_next() else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
            let finished = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                _ = self.process(&task) => true,
            };
            self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

            if !finished {
                info!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    "Shutdown while handling task, leaving it in flight"
                );
                break;
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, task: &Task) {
        let started = Instant::now();
        match self.attempt(task).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.stats.record_completion(elapsed);
                self.metrics
                    .record_task_duration(&task.task_type, elapsed.as_secs_f64());
                if let Err(e) = self.queue.complete(task.id) {
                    error!(task_id = %task.id, error = %e, "Failed to complete task");
                }
            }
            Err(reason) => {
                let elapsed = started.elapsed();
                self.stats.record_failure(elapsed);
                warn!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempt = task.attempts + 1,
                    error = %reason,
                    "Task attempt failed"
                );
                if let Err(e) = self.queue.fail(task.id, &reason) {
                    error!(task_id = %task.id, error = %e, "Failed to record task failure");
                }
                if let Some(alerts) = &self.alerts {
                    if let Err(e) = alerts.record_event(AlertType::ErrorRate).await {
                        debug!(error = %e, "Error rate alert not evaluated");
                    }
                }
            }
        }
    }

    async fn attempt(&self, task: &Task) -> Result<(), String> {
        let handler = self
            .handlers
            .get(&task.task_type)
            .ok_or_else(|| format!("no handler registered for task type '{}'", task.task_type))?;

        if let Some(key) = handler.rate_limit_key() {
            let admitted = self
                .limiter
                .wait_for_availability(key, self.config.admission_timeout)
                .await
                .map_err(|e| e.to_string())?;
            if !admitted {
                return Err(format!(
                    "rate limit '{}' not available within {:?}",
                    key, self.config.admission_timeout
                ));
            }
        }

        match tokio::time::timeout(self.config.task_timeout, handler.handle(task)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.config.task_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, QueueConfig, TaskStatus};
    use crate::rate_limit::RateLimitRule;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        fn task_type(&self) -> &str {
            "transform"
        }

        async fn handle(&self, task: &Task) -> anyhow::Result<()> {
            let label = task.payload["label"].as_str().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(label);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        fn task_type(&self) -> &str {
            "publish"
        }

        fn rate_limit_key(&self) -> Option<&str> {
            Some("publish")
        }

        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            anyhow::bail!("remote rejected the post")
        }
    }

    struct StuckHandler;

    #[async_trait]
    impl TaskHandler for StuckHandler {
        fn task_type(&self) -> &str {
            "stuck"
        }

        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn fast_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(workers)
            .with_poll_interval(Duration::from_millis(5))
            .with_admission_timeout(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_task_timeout(Duration::from_secs(10))
            .with_admission_timeout(Duration::from_secs(2));
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.task_timeout, Duration::from_secs(10));
        assert_eq!(config.admission_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_pool_stats_success_rate() {
        let stats = PoolStats {
            tasks_completed: 3,
            tasks_failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_single_worker_drains_by_priority() {
        let queue = Arc::new(TaskQueue::default());
        for (label, priority) in [
            ("low", crate::queue::TaskPriority::Low),
            ("high", crate::queue::TaskPriority::High),
            ("medium", crate::queue::TaskPriority::Medium),
        ] {
            queue
                .enqueue(
                    "transform",
                    serde_json::json!({ "label": label }),
                    EnqueueOptions::new().with_priority(priority),
                )
                .expect("enqueue");
        }

        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let mut pool = WorkerPool::new(
            fast_config(1),
            Arc::clone(&queue),
            Arc::new(RateLimiter::new()),
        );
        pool.register(handler.clone());
        pool.start().expect("start");

        wait_until(|| queue.stats().completed == 3).await;
        pool.shutdown().await.expect("shutdown");

        assert_eq!(*handler.seen.lock().unwrap(), vec!["high", "medium", "low"]);
        assert_eq!(pool.stats().tasks_completed, 3);
    }

    #[tokio::test]
    async fn test_failures_retry_and_alert() {
        let queue = Arc::new(TaskQueue::new(QueueConfig {
            retry_base: Duration::ZERO,
            ..QueueConfig::default()
        }));
        let id = queue
            .enqueue(
                "publish",
                serde_json::Value::Null,
                EnqueueOptions::new().with_max_attempts(2),
            )
            .expect("enqueue");

        let limiter = Arc::new(RateLimiter::new());
        limiter
            .add_rule("publish", RateLimitRule::token_bucket(100, Duration::from_secs(1)))
            .expect("rule");
        let alerts = Arc::new(AlertManager::with_default_rules(Duration::from_secs(3600)));

        let mut pool = WorkerPool::new(fast_config(1), Arc::clone(&queue), limiter.clone())
            .with_alerts(alerts.clone());
        pool.register(Arc::new(FailingHandler));
        pool.start().expect("start");

        wait_until(|| queue.stats().failed == 1).await;
        pool.shutdown().await.expect("shutdown");

        let task = queue.get(id).expect("retained");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert!(task
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("remote rejected")));
        assert_eq!(limiter.key_stats("publish").expect("stats").admitted, 2);
        assert_eq!(pool.stats().tasks_failed, 2);
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails() {
        let queue = Arc::new(TaskQueue::default());
        let id = queue
            .enqueue(
                "mystery",
                serde_json::Value::Null,
                EnqueueOptions::new().with_max_attempts(1),
            )
            .expect("enqueue");

        let mut pool = WorkerPool::new(fast_config(1), Arc::clone(&queue), Arc::new(RateLimiter::new()));
        pool.start().expect("start");
        wait_until(|| queue.stats().failed == 1).await;
        pool.shutdown().await.expect("shutdown");

        let task = queue.get(id).expect("retained");
        assert!(task
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no handler")));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_task_in_flight() {
        let queue = Arc::new(TaskQueue::default());
        let id = queue
            .enqueue("stuck", serde_json::Value::Null, EnqueueOptions::new())
            .expect("enqueue");

        let mut pool = WorkerPool::new(fast_config(1), Arc::clone(&queue), Arc::new(RateLimiter::new()));
        pool.register(Arc::new(StuckHandler));
        pool.start().expect("start");
        wait_until(|| queue.stats().processing == 1).await;

        pool.shutdown().await.expect("shutdown");
        assert!(!pool.is_running());
        assert_eq!(queue.get(id).expect("task").status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut pool = WorkerPool::new(
            fast_config(1),
            Arc::new(TaskQueue::default()),
            Arc::new(RateLimiter::new()),
        );
        pool.start().expect("start");
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));
        pool.shutdown().await.expect("shutdown");
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }
}
