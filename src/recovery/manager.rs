//! Cooldown-gated self-healing.
//!
//! A scan walks the registered actions in order. An action whose cooldown has
//! elapsed and whose condition holds on the latest health snapshot is stamped
//! and then executed. Effects run one at a time because several of them touch
//! the same durable storage. An effect failure is logged, counted and reported
//! to the alert manager, and never leaves the scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::action::{default_actions, RecoveryAction, RecoveryKind, RecoveryOutcome, RecoveryStats};
use crate::alerts::{AlertManager, AlertType};
use crate::error::{RecoveryError, StorageError};
use crate::health::{ExternalService, HealthChecker, HealthSnapshot};
use crate::metrics::MetricsCollector;
use crate::queue::{QueueStorage, TaskQueue};

/// Read access to the latest health snapshot.
pub trait SnapshotSource: Send + Sync {
    fn latest_snapshot(&self) -> Option<Arc<HealthSnapshot>>;
}

impl SnapshotSource for HealthChecker {
    fn latest_snapshot(&self) -> Option<Arc<HealthSnapshot>> {
        self.latest()
    }
}

/// One executed action within a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    pub action: String,
    pub outcome: RecoveryOutcome,
}

/// Watches health snapshots and runs recovery effects.
pub struct RecoveryManager {
    health: Arc<dyn SnapshotSource>,
    queue: Arc<TaskQueue>,
    storage: Arc<QueueStorage>,
    services: HashMap<String, Arc<dyn ExternalService>>,
    alerts: Option<Arc<AlertManager>>,
    actions: Mutex<Vec<RecoveryAction>>,
    scanning: tokio::sync::Mutex<()>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("actions", &*self.lock())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Creates a manager with the default action set, with one reinit action
    /// per service.
    pub fn new(
        health: Arc<dyn SnapshotSource>,
        queue: Arc<TaskQueue>,
        storage: Arc<QueueStorage>,
        services: Vec<Arc<dyn ExternalService>>,
    ) -> Self {
        let services: HashMap<String, Arc<dyn ExternalService>> = services
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        let mut names: Vec<&str> = services.keys().map(String::as_str).collect();
        names.sort_unstable();
        let actions = default_actions(names);

        Self {
            health,
            queue,
            storage,
            services,
            alerts: None,
            actions: Mutex::new(actions),
            scanning: tokio::sync::Mutex::new(()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Reports failed effects to `alerts` and prunes its history on memory trim.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Replaces the registered actions.
    pub fn with_actions(self, actions: Vec<RecoveryAction>) -> Self {
        *self.lock() = actions;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecoveryAction>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs one scan now.
    pub async fn scan(&self) -> Vec<RecoveryReport> {
        self.scan_at(Utc::now()).await
    }

    /// Runs one scan as of `now`. A scan already in progress makes this a
    /// no-op. Returns the actions executed.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Vec<RecoveryReport> {
        let Ok(_guard) = self.scanning.try_lock() else {
            debug!("Recovery scan already running, skipping");
            return Vec::new();
        };

        let Some(snapshot) = self.health.latest_snapshot() else {
            debug!("No health snapshot yet, skipping recovery scan");
            return Vec::new();
        };

        let due: Vec<(usize, RecoveryAction)> = {
            let mut actions = self.lock();
            actions
                .iter_mut()
                .enumerate()
                .filter(|(_, a)| !a.is_cooling_down(now) && a.kind.condition_met(&snapshot))
                .map(|(i, a)| {
                    a.last_executed = Some(now);
                    (i, a.clone())
                })
                .collect()
        };

        let mut reports = Vec::with_capacity(due.len());
        for (index, action) in due {
            info!(action = %action.name, "Starting recovery action");
            let outcome = match self.execute(&action.kind, now).await {
                Ok(detail) => {
                    info!(action = %action.name, detail = %detail, "Recovery action succeeded");
                    RecoveryOutcome::Succeeded(detail)
                }
                Err(e) => {
                    error!(action = %action.name, error = %e, "Recovery action failed");
                    if let Some(alerts) = &self.alerts {
                        if let Err(e) = alerts.record_event(AlertType::SystemHealth).await {
                            debug!(error = %e, "System health alert not evaluated");
                        }
                    }
                    RecoveryOutcome::Failed(e.to_string())
                }
            };
            self.metrics
                .record_recovery(&action.name, outcome.is_success());

            if let Some(entry) = self.lock().get_mut(index) {
                entry.executions += 1;
                if !outcome.is_success() {
                    entry.failures += 1;
                }
                entry.last_outcome = Some(outcome.clone());
            }
            reports.push(RecoveryReport {
                action: action.name,
                outcome,
            });
        }

        reports
    }

    async fn execute(&self, kind: &RecoveryKind, now: DateTime<Utc>) -> Result<String, RecoveryError> {
        match kind {
            RecoveryKind::QueueRebuild => self.rebuild_queue(now).await,
            RecoveryKind::StorageRestore => self.restore_storage().await,
            RecoveryKind::ServiceReinit { service } => self.reinit_service(service).await,
            RecoveryKind::MemoryTrim => Ok(self.trim_memory(now)),
        }
    }

    /// Backs up durable state, loads it, and swaps it in as the pending set.
    /// Terminal records are dropped so the failed count starts over.
    async fn rebuild_queue(&self, now: DateTime<Utc>) -> Result<String, RecoveryError> {
        let backup = self.storage.create_backup_at(now).await?;
        let snapshot = self.storage.load_snapshot().await?;
        let depth = self.queue.replace_state(snapshot, now);
        let dropped = self.queue.trim();
        Ok(format!(
            "requeued {} tasks from storage (backup {}), dropped {} terminal records",
            depth, backup, dropped
        ))
    }

    /// Activates the newest valid backup, or starts from empty storage when
    /// no backup verifies.
    async fn restore_storage(&self) -> Result<String, RecoveryError> {
        match self.storage.recover_from_backup().await {
            Ok((name, snapshot)) => Ok(format!(
                "restored {} tasks from {}",
                snapshot.len(),
                name
            )),
            Err(StorageError::NoValidBackup) => {
                warn!("No valid backup, initializing fresh storage");
                self.storage.clean().await?;
                Ok("initialized fresh storage".to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reinit_service(&self, name: &str) -> Result<String, RecoveryError> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| RecoveryError::UnknownService(name.to_string()))?;

        service.teardown().await?;
        service.initialize().await?;
        if !service.check_health().await? {
            return Err(RecoveryError::StillUnhealthy(name.to_string()));
        }
        Ok(format!("{} reinitialized", name))
    }

    fn trim_memory(&self, now: DateTime<Utc>) -> String {
        let tasks = self.queue.trim();
        let alerts = self
            .alerts
            .as_ref()
            .map_or(0, |alerts| alerts.prune_history_at(now));
        format!(
            "dropped {} terminal tasks and {} resolved alerts",
            tasks, alerts
        )
    }

    /// Cooldown and outcome counters for every action.
    pub fn recovery_stats(&self) -> Vec<RecoveryStats> {
        self.recovery_stats_at(Utc::now())
    }

    pub fn recovery_stats_at(&self, now: DateTime<Utc>) -> Vec<RecoveryStats> {
        self.lock()
            .iter()
            .map(|a| RecoveryStats {
                name: a.name.clone(),
                kind: a.kind.clone(),
                last_executed: a.last_executed,
                cooldown_remaining_ms: a.cooldown_remaining(now).as_millis() as u64,
                executions: a.executions,
                failures: a.failures,
                last_outcome: a.last_outcome.clone(),
            })
            .collect()
    }
}
