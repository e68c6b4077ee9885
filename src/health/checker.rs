//! Periodic health aggregation.
//!
//! A check queries every component through the read-only probes, grades each
//! against fixed thresholds, and publishes one immutable [`HealthSnapshot`].
//! Checks never overlap: a trigger that arrives while a check is running is
//! coalesced into it.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::probes::{BudgetSource, ExternalService, QueueStatsSource, ResourceSampler, StorageProbe};
use super::types::{
    ComponentHealth, HealthSnapshot, HealthStatus, HealthThresholds, QUEUE_COMPONENT,
    RATE_LIMITER_COMPONENT, STORAGE_COMPONENT, SYSTEM_COMPONENT,
};
use crate::alerts::{AlertManager, AlertType};
use crate::metrics::MetricsCollector;

/// Default bound on a single async probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Detail key carrying the sampled memory percentage of the system component.
const MEMORY_PERCENT_DETAIL: &str = "memoryPercent";

/// Error raised by a component check itself, as opposed to a component
/// reporting itself unhealthy.
type ProbeFailure = String;

/// Aggregates component health into snapshots.
pub struct HealthChecker {
    queue: Arc<dyn QueueStatsSource>,
    budgets: Arc<dyn BudgetSource>,
    storage: Arc<dyn StorageProbe>,
    sampler: Arc<dyn ResourceSampler>,
    services: Vec<Arc<dyn ExternalService>>,
    alerts: Option<Arc<AlertManager>>,
    thresholds: HealthThresholds,
    probe_timeout: Duration,
    checking: tokio::sync::Mutex<()>,
    latest: RwLock<Option<Arc<HealthSnapshot>>>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("thresholds", &self.thresholds)
            .field("probe_timeout", &self.probe_timeout)
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(
        queue: Arc<dyn QueueStatsSource>,
        budgets: Arc<dyn BudgetSource>,
        storage: Arc<dyn StorageProbe>,
        sampler: Arc<dyn ResourceSampler>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            queue,
            budgets,
            storage,
            sampler,
            services: Vec::new(),
            alerts: None,
            thresholds,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            checking: tokio::sync::Mutex::new(()),
            latest: RwLock::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Adds an external service whose liveness becomes a component.
    pub fn with_service(mut self, service: Arc<dyn ExternalService>) -> Self {
        self.services.push(service);
        self
    }

    /// Surfaces breaches through `alerts`.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Latest published snapshot, if any check has completed.
    pub fn latest(&self) -> Option<Arc<HealthSnapshot>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Runs a check unless one is already in progress, in which case this
    /// trigger is dropped and `None` is returned. Used by the poll loop.
    pub async fn poll(&self) -> Option<Arc<HealthSnapshot>> {
        let _guard = self.checking.try_lock().ok()?;
        Some(self.run_check(Utc::now()).await)
    }

    /// Runs a check, or waits for the one in progress and returns its result.
    pub async fn check_health(&self) -> Arc<HealthSnapshot> {
        match self.checking.try_lock() {
            Ok(_guard) => self.run_check(Utc::now()).await,
            Err(_) => {
                let _guard = self.checking.lock().await;
                match self.latest() {
                    Some(snapshot) => snapshot,
                    None => self.run_check(Utc::now()).await,
                }
            }
        }
    }

    async fn run_check(&self, now: DateTime<Utc>) -> Arc<HealthSnapshot> {
        let started = Instant::now();
        let mut components = BTreeMap::new();
        let mut failures: Vec<(String, ProbeFailure)> = Vec::new();

        let checks: Vec<(String, Result<ComponentHealth, ProbeFailure>)> = vec![
            (
                QUEUE_COMPONENT.to_string(),
                self.guarded(QUEUE_COMPONENT, async { self.check_queue(now) })
                    .await,
            ),
            (
                RATE_LIMITER_COMPONENT.to_string(),
                self.guarded(RATE_LIMITER_COMPONENT, async { self.check_rate_limiter(now) })
                    .await,
            ),
            (
                STORAGE_COMPONENT.to_string(),
                self.guarded(STORAGE_COMPONENT, self.check_storage(now))
                    .await,
            ),
            (
                SYSTEM_COMPONENT.to_string(),
                self.guarded(SYSTEM_COMPONENT, async { self.check_system(now) })
                    .await,
            ),
        ];

        let mut service_checks = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let name = service.name().to_string();
            let result = self
                .guarded(&name, Self::check_service(Arc::clone(service), now))
                .await;
            service_checks.push((name, result));
        }

        for (name, result) in checks.into_iter().chain(service_checks) {
            match result {
                Ok(health) => {
                    components.insert(name, health);
                }
                Err(reason) => {
                    error!(component = %name, error = %reason, "Health check raised");
                    components.insert(
                        name.clone(),
                        ComponentHealth::unhealthy(format!("check failed: {}", reason), now)
                            .with_details(json!({ "error": reason })),
                    );
                    failures.push((name, reason));
                }
            }
        }

        if !failures.is_empty() {
            let errors: serde_json::Map<String, serde_json::Value> = failures
                .iter()
                .map(|(name, reason)| (name.clone(), json!(reason)))
                .collect();
            let system = components
                .entry(SYSTEM_COMPONENT.to_string())
                .or_insert_with(|| ComponentHealth::healthy(now));
            system.escalate(
                HealthStatus::Unhealthy,
                format!("{} component check(s) failed", failures.len()),
            );
            match &mut system.details {
                serde_json::Value::Object(map) => {
                    map.insert("errors".to_string(), serde_json::Value::Object(errors));
                }
                other => *other = json!({ "errors": errors }),
            }
        }

        let snapshot = Arc::new(HealthSnapshot::new(components, now));
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&snapshot));

        let elapsed = started.elapsed();
        self.metrics
            .record_health_check(snapshot.status.score(), elapsed.as_secs_f64());

        match snapshot.status {
            HealthStatus::Healthy => debug!(elapsed_ms = elapsed.as_millis() as u64, "Health check passed"),
            status => warn!(
                status = %status,
                elapsed_ms = elapsed.as_millis() as u64,
                "Health check reported problems"
            ),
        }

        self.surface_alerts(&snapshot).await;
        snapshot
    }

    /// Runs one component check with a timeout, turning a panic or timeout
    /// into a probe failure.
    async fn guarded<F>(&self, component: &str, check: F) -> Result<ComponentHealth, ProbeFailure>
    where
        F: Future<Output = Result<ComponentHealth, ProbeFailure>>,
    {
        match tokio::time::timeout(self.probe_timeout, AssertUnwindSafe(check).catch_unwind()).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(panic_message(panic)),
            Err(_) => Err(format!(
                "{} check timed out after {:?}",
                component, self.probe_timeout
            )),
        }
    }

    fn check_queue(&self, now: DateTime<Utc>) -> Result<ComponentHealth, ProbeFailure> {
        let stats = self.queue.queue_stats();
        let details = serde_json::to_value(&stats).map_err(|e| e.to_string())?;

        let mut health = ComponentHealth::healthy(now);
        if stats.failed > self.thresholds.failed_tasks_unhealthy {
            health.escalate(
                HealthStatus::Unhealthy,
                format!("Too many failed tasks: {}", stats.failed),
            );
        }
        if stats.depth > self.thresholds.queue_depth_degraded {
            health.escalate(
                HealthStatus::Degraded,
                format!("Queue depth high: {}", stats.depth),
            );
        }
        Ok(health.with_details(details))
    }

    fn check_rate_limiter(&self, now: DateTime<Utc>) -> Result<ComponentHealth, ProbeFailure> {
        let mut low = Vec::new();
        for key in &self.thresholds.watched_rate_limit_keys {
            let remaining = self.budgets.remaining(key).map_err(|e| e.to_string())?;
            if remaining < self.thresholds.rate_limit_low_watermark {
                low.push(format!("{} ({} left)", key, remaining));
            }
        }

        let details =
            serde_json::to_value(self.budgets.budget_stats()).map_err(|e| e.to_string())?;
        let health = if low.is_empty() {
            ComponentHealth::healthy(now)
        } else {
            ComponentHealth::degraded(format!("Rate limit budget low: {}", low.join(", ")), now)
        };
        Ok(health.with_details(json!({ "keys": details })))
    }

    async fn check_storage(&self, now: DateTime<Utc>) -> Result<ComponentHealth, ProbeFailure> {
        Ok(match self.storage.probe().await {
            Ok(()) => ComponentHealth::healthy(now),
            Err(e) => ComponentHealth::unhealthy(format!("Storage round-trip failed: {}", e), now),
        })
    }

    fn check_system(&self, now: DateTime<Utc>) -> Result<ComponentHealth, ProbeFailure> {
        let usage = self.sampler.sample().map_err(|e| e.to_string())?;

        let mut health = ComponentHealth::healthy(now);
        if usage.memory_percent > self.thresholds.memory_percent_degraded {
            health.escalate(
                HealthStatus::Degraded,
                format!("High memory usage: {:.1}%", usage.memory_percent),
            );
        }
        if usage.cpu_percent > self.thresholds.cpu_percent_degraded {
            health.escalate(
                HealthStatus::Degraded,
                format!("High CPU usage: {:.1}%", usage.cpu_percent),
            );
        }
        Ok(health.with_details(json!({
            MEMORY_PERCENT_DETAIL: usage.memory_percent,
            "cpuPercent": usage.cpu_percent,
            "memoryUsedBytes": usage.memory_used_bytes,
            "memoryTotalBytes": usage.memory_total_bytes,
            "uptimeSecs": usage.uptime_secs,
        })))
    }

    async fn check_service(
        service: Arc<dyn ExternalService>,
        now: DateTime<Utc>,
    ) -> Result<ComponentHealth, ProbeFailure> {
        Ok(match service.check_health().await {
            Ok(true) => ComponentHealth::healthy(now),
            Ok(false) => {
                ComponentHealth::unhealthy(format!("{} is not responding", service.name()), now)
            }
            Err(e) => ComponentHealth::unhealthy(e.to_string(), now),
        })
    }

    async fn surface_alerts(&self, snapshot: &HealthSnapshot) {
        let Some(alerts) = &self.alerts else {
            return;
        };

        if snapshot.status == HealthStatus::Unhealthy {
            if let Err(e) = alerts.check_condition(AlertType::SystemHealth, 1.0).await {
                debug!(error = %e, "System health alert not evaluated");
            }
        } else if snapshot.status == HealthStatus::Healthy {
            let resolved = alerts.resolve_type(AlertType::SystemHealth);
            if resolved > 0 {
                info!(resolved = resolved, "System healthy again, resolved alerts");
            }
        }

        let memory_percent = snapshot
            .components
            .get(SYSTEM_COMPONENT)
            .and_then(|c| c.details.get(MEMORY_PERCENT_DETAIL))
            .and_then(serde_json::Value::as_f64);
        if let Some(percent) = memory_percent {
            match alerts.rule(AlertType::MemoryUsage) {
                Ok(rule) if percent < rule.threshold => {
                    alerts.resolve_type(AlertType::MemoryUsage);
                }
                _ => {
                    if let Err(e) = alerts.check_condition(AlertType::MemoryUsage, percent).await {
                        debug!(error = %e, "Memory alert not evaluated");
                    }
                }
            }
        }

        if snapshot.component_status(RATE_LIMITER_COMPONENT) == Some(HealthStatus::Degraded) {
            if let Err(e) = alerts.record_event(AlertType::RateLimit).await {
                debug!(error = %e, "Rate limit alert not evaluated");
            }
        } else {
            alerts.resolve_type(AlertType::RateLimit);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
