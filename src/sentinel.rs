//! Wires the subsystems together and drives their periodic loops.
//!
//! A [`Sentinel`] owns one instance of every component and injects them into
//! each other at construction. Nothing is global: two sentinels in the same
//! process share no state apart from the metrics registry.
//!
//! # Loops
//!
//! | Loop     | Interval            | Body                                   |
//! |----------|---------------------|----------------------------------------|
//! | health   | `health_interval`   | `HealthChecker::poll`                  |
//! | recovery | `recovery_interval` | `RecoveryManager::scan`                |
//! | snapshot | `snapshot_interval` | retention pruning, then `persist`      |
//! | backup   | `backup_interval`   | `QueueStorage::create_backup`          |
//!
//! Every loop is cancelled through one `CancellationToken`. A loop body that
//! fails or panics is logged and the loop keeps ticking.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertManager, NotificationRoutes};
use crate::config::{ConfigError, SentinelConfig};
use crate::error::StorageError;
use crate::health::{
    ExternalService, HealthApi, HealthChecker, HealthSnapshot, ResourceSampler, SystemSampler,
};
use crate::metrics::init_metrics;
use crate::queue::{
    DurableStore, FileStore, PoolError, QueueSnapshot, QueueStorage, TaskHandler, TaskQueue,
    WorkerPool, WorkerPoolConfig,
};
use crate::rate_limit::RateLimiter;
use crate::recovery::RecoveryManager;

/// Errors raised while building or running a sentinel.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Sentinel is already running")]
    AlreadyRunning,
}

/// Collects the pluggable parts of a [`Sentinel`].
pub struct SentinelBuilder {
    config: SentinelConfig,
    store: Option<Arc<dyn DurableStore>>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    limiter: Option<Arc<RateLimiter>>,
    routes: NotificationRoutes,
    services: Vec<Arc<dyn ExternalService>>,
    handlers: Vec<Arc<dyn TaskHandler>>,
}

impl SentinelBuilder {
    /// Uses `store` instead of a [`FileStore`] under `config.storage_dir`.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `sampler` instead of [`SystemSampler`].
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Uses `limiter` instead of one with the default rules.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_notifications(mut self, routes: NotificationRoutes) -> Self {
        self.routes = routes;
        self
    }

    /// Adds an external service to health checks and recovery.
    pub fn with_service(mut self, service: Arc<dyn ExternalService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validates the configuration, constructs every component and restores
    /// the queue from storage.
    ///
    /// # Errors
    ///
    /// Returns `SentinelError::Config` for an invalid configuration and
    /// `SentinelError::Metrics` if metric registration fails. An unreadable
    /// stored queue is not an error: the newest valid backup is used, or the
    /// queue starts empty.
    pub async fn build(self) -> Result<Sentinel, SentinelError> {
        self.config.validate()?;
        init_metrics()?;

        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileStore::new(config.storage_dir.clone())) as Arc<dyn DurableStore>);
        let storage = Arc::new(QueueStorage::new(store, config.max_backups));
        let queue = Arc::new(TaskQueue::new(config.queue.clone()));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::with_default_rules()));
        let alerts = Arc::new(
            AlertManager::with_default_rules(config.alert_history).with_routes(self.routes),
        );
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SystemSampler::new()) as Arc<dyn ResourceSampler>);

        let mut checker = HealthChecker::new(
            queue.clone(),
            limiter.clone(),
            storage.clone(),
            sampler,
            config.thresholds.clone(),
        )
        .with_alerts(alerts.clone());
        for service in &self.services {
            checker = checker.with_service(Arc::clone(service));
        }
        let checker = Arc::new(checker);

        let recovery = Arc::new(
            RecoveryManager::new(
                checker.clone(),
                queue.clone(),
                storage.clone(),
                self.services,
            )
            .with_alerts(alerts.clone()),
        );

        let pool_config = WorkerPoolConfig::new(config.num_workers)
            .with_task_timeout(config.task_timeout)
            .with_admission_timeout(config.admission_timeout)
            .with_shutdown_timeout(config.shutdown_timeout);
        let mut pool = WorkerPool::new(pool_config, queue.clone(), limiter.clone())
            .with_alerts(alerts.clone());
        for handler in self.handlers {
            pool.register(handler);
        }

        restore_queue(&storage, &queue).await;

        Ok(Sentinel {
            config,
            queue,
            limiter,
            storage,
            alerts,
            checker,
            recovery,
            pool,
            cancel: CancellationToken::new(),
            loops: Vec::new(),
        })
    }
}

/// Loads the stored queue, falling back to the newest valid backup.
async fn restore_queue(storage: &QueueStorage, queue: &TaskQueue) {
    let snapshot = match storage.load_snapshot().await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, "Stored queue unreadable, trying backups");
            match storage.recover_from_backup().await {
                Ok((_, snapshot)) => Some(snapshot),
                Err(e) => {
                    error!(error = %e, "No usable queue state, starting empty");
                    None
                }
            }
        }
    };

    if let Some(snapshot) = snapshot {
        queue.restore(snapshot, Utc::now());
    }
}

/// The running system.
pub struct Sentinel {
    config: SentinelConfig,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimiter>,
    storage: Arc<QueueStorage>,
    alerts: Arc<AlertManager>,
    checker: Arc<HealthChecker>,
    recovery: Arc<RecoveryManager>,
    pool: WorkerPool,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel")
            .field("config", &self.config)
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}

impl Sentinel {
    pub fn builder(config: SentinelConfig) -> SentinelBuilder {
        SentinelBuilder {
            config,
            store: None,
            sampler: None,
            limiter: None,
            routes: NotificationRoutes::default(),
            services: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn storage(&self) -> &Arc<QueueStorage> {
        &self.storage
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn health_api(&self) -> HealthApi {
        HealthApi::new(Arc::clone(&self.checker))
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        !self.loops.is_empty()
    }

    /// Runs a first health check, then starts the workers and every loop.
    pub async fn start(&mut self) -> Result<Arc<HealthSnapshot>, SentinelError> {
        if self.is_running() {
            return Err(SentinelError::AlreadyRunning);
        }

        let first = self.checker.check_health().await;
        self.cancel = CancellationToken::new();

        let checker = Arc::clone(&self.checker);
        self.loops.push(spawn_loop(
            "health",
            self.config.health_interval,
            self.cancel.child_token(),
            move || {
                let checker = Arc::clone(&checker);
                async move {
                    if checker.poll().await.is_none() {
                        debug!("Health check still running, tick coalesced");
                    }
                }
            },
        ));

        let recovery = Arc::clone(&self.recovery);
        self.loops.push(spawn_loop(
            "recovery",
            self.config.recovery_interval,
            self.cancel.child_token(),
            move || {
                let recovery = Arc::clone(&recovery);
                async move {
                    recovery.scan().await;
                }
            },
        ));

        let (storage, queue) = (Arc::clone(&self.storage), Arc::clone(&self.queue));
        let alerts = Arc::clone(&self.alerts);
        self.loops.push(spawn_loop(
            "snapshot",
            self.config.snapshot_interval,
            self.cancel.child_token(),
            move || {
                let (storage, queue) = (Arc::clone(&storage), Arc::clone(&queue));
                let alerts = Arc::clone(&alerts);
                async move {
                    let pruned = queue.prune_terminal();
                    let dropped = alerts.prune_history();
                    if pruned > 0 || dropped > 0 {
                        debug!(tasks = pruned, alerts = dropped, "Expired records pruned");
                    }
                    match storage.persist(&queue).await {
                        Ok(snapshot) => debug!(tasks = snapshot.len(), "Queue snapshot saved"),
                        Err(e) => error!(error = %e, "Queue snapshot failed"),
                    }
                }
            },
        ));

        let storage = Arc::clone(&self.storage);
        self.loops.push(spawn_loop(
            "backup",
            self.config.backup_interval,
            self.cancel.child_token(),
            move || {
                let storage = Arc::clone(&storage);
                async move {
                    if let Err(e) = storage.create_backup().await {
                        error!(error = %e, "Queue backup failed");
                    }
                }
            },
        ));

        if self.pool.handler_count() > 0 {
            self.pool.start()?;
        } else {
            info!("No task handlers registered, workers not started");
        }
        info!(status = %first.status, "Sentinel started");
        Ok(first)
    }

    /// Stops the loops and workers, then persists the queue.
    ///
    /// Tasks still in flight are persisted as in flight and reclaimed by the
    /// next cold start.
    pub async fn shutdown(&mut self) -> Result<QueueSnapshot, SentinelError> {
        info!("Sentinel shutting down");
        self.cancel.cancel();
        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Loop task failed to join");
            }
        }

        if self.pool.is_running() {
            if let Err(e) = self.pool.shutdown().await {
                warn!(error = %e, "Worker pool did not stop cleanly");
            }
        }

        let snapshot = self.storage.persist(&self.queue).await?;
        info!(
            pending = snapshot.pending.len(),
            in_flight = snapshot.in_flight.len(),
            "Sentinel stopped, queue persisted"
        );
        Ok(snapshot)
    }
}

/// Spawns a loop that runs `body` every `period` until `cancel` fires. The
/// first run happens one period after spawning.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if AssertUnwindSafe(body()).catch_unwind().await.is_err() {
                        error!(loop_name = name, "Loop body panicked");
                    }
                }
            }
        }

        debug!(loop_name = name, "Loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertType;
    use crate::error::ServiceError;
    use crate::health::ResourceUsage;
    use crate::queue::{EnqueueOptions, MemoryStore, QueueConfig, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Quiet;

    impl ResourceSampler for Quiet {
        fn sample(&self) -> Result<ResourceUsage, ServiceError> {
            Ok(ResourceUsage {
                memory_used_bytes: 1,
                memory_total_bytes: 100,
                memory_percent: 1.0,
                cpu_percent: 1.0,
                uptime_secs: 0,
            })
        }
    }

    fn fast_config() -> SentinelConfig {
        SentinelConfig::default()
            .with_health_interval(Duration::from_millis(20))
            .with_recovery_interval(Duration::from_millis(20))
            .with_snapshot_interval(Duration::from_millis(20))
            .with_backup_interval(Duration::from_millis(50))
    }

    async fn build(store: Arc<MemoryStore>) -> Sentinel {
        Sentinel::builder(fast_config())
            .with_store(store)
            .with_sampler(Arc::new(Quiet))
            .build()
            .await
            .expect("build")
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Sentinel::builder(SentinelConfig::default().with_workers(0))
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await;
        assert!(matches!(result, Err(SentinelError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_persist_queue() {
        let store = Arc::new(MemoryStore::new());
        let mut sentinel = build(store.clone()).await;
        let id = sentinel
            .queue()
            .enqueue("unhandled_later", serde_json::Value::Null, EnqueueOptions::new())
            .expect("enqueue");

        // Claim the task before workers start so it is in flight at shutdown.
        assert_eq!(sentinel.queue().dequeue_next().map(|t| t.id), Some(id));

        let first = sentinel.start().await.expect("start");
        assert!(sentinel.is_running());
        assert!(matches!(sentinel.start().await, Err(SentinelError::AlreadyRunning)));
        assert!(sentinel.health().latest().is_some());
        assert_eq!(first.timestamp, sentinel.health().latest().expect("snapshot").timestamp);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let snapshot = sentinel.shutdown().await.expect("shutdown");
        assert!(!sentinel.is_running());
        assert_eq!(snapshot.in_flight.len(), 1);
        assert_eq!(snapshot.in_flight[0].status, TaskStatus::Processing);
        assert!(!sentinel.storage().list_backups().await.expect("list").is_empty());

        let restarted = build(store).await;
        let task = restarted.queue().get(id).expect("reclaimed");
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_corrupt_store_falls_back_to_backup() {
        let store = Arc::new(MemoryStore::new());
        {
            let sentinel = build(store.clone()).await;
            sentinel
                .queue()
                .enqueue("t", serde_json::Value::Null, EnqueueOptions::new())
                .expect("enqueue");
            sentinel.storage().persist(sentinel.queue()).await.expect("persist");
            sentinel.storage().create_backup().await.expect("backup");
        }
        store.put_raw("queue", b"{not json".to_vec()).await;

        let sentinel = build(store).await;
        assert_eq!(sentinel.queue().stats().depth, 1);
    }

    #[tokio::test]
    async fn test_snapshot_loop_applies_retention() {
        let mut config = fast_config().with_queue(QueueConfig {
            terminal_retention: Duration::from_millis(1),
            ..QueueConfig::default()
        });
        config.alert_history = Duration::from_secs(3600);
        let mut sentinel = Sentinel::builder(config)
            .with_store(Arc::new(MemoryStore::new()))
            .with_sampler(Arc::new(Quiet))
            .build()
            .await
            .expect("build");

        sentinel
            .queue()
            .enqueue("t", serde_json::Value::Null, EnqueueOptions::new())
            .expect("enqueue");
        let task = sentinel.queue().dequeue_next().expect("dequeue");
        sentinel.queue().complete(task.id).expect("complete");
        sentinel
            .alerts()
            .check_condition_at(
                AlertType::ErrorRate,
                10.0,
                Utc::now() - chrono::Duration::hours(2),
            )
            .await
            .expect("rule")
            .expect("raised");
        assert_eq!(sentinel.queue().terminal_tasks().len(), 1);

        sentinel.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(120)).await;
        sentinel.shutdown().await.expect("shutdown");

        assert!(sentinel.queue().terminal_tasks().is_empty());
        assert!(sentinel.alerts().active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_loop_survives_panicking_body() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let handle = spawn_loop("test", Duration::from_millis(5), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.expect("join");
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
