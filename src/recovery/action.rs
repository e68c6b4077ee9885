//! Recovery action kinds and their trigger conditions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{
    HealthSnapshot, HealthStatus, QUEUE_COMPONENT, STORAGE_COMPONENT, SYSTEM_COMPONENT,
};
use crate::utils::duration_since;

/// What a recovery action does. Each kind has one fixed trigger condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Rebuild the in-memory queue from durable storage.
    /// Triggered when the queue component is unhealthy.
    QueueRebuild,
    /// Restore durable storage from the newest valid backup.
    /// Triggered when the storage component is unhealthy.
    StorageRestore,
    /// Tear down and reinitialize an external service client.
    /// Triggered when that service's component is unhealthy.
    ServiceReinit { service: String },
    /// Drop terminal records and stale alert history.
    /// Triggered when the system component is degraded or unhealthy.
    MemoryTrim,
}

impl RecoveryKind {
    /// Evaluates the trigger condition against a snapshot.
    pub fn condition_met(&self, snapshot: &HealthSnapshot) -> bool {
        match self {
            RecoveryKind::QueueRebuild => {
                snapshot.component_status(QUEUE_COMPONENT) == Some(HealthStatus::Unhealthy)
            }
            RecoveryKind::StorageRestore => {
                snapshot.component_status(STORAGE_COMPONENT) == Some(HealthStatus::Unhealthy)
            }
            RecoveryKind::ServiceReinit { service } => {
                snapshot.component_status(service) == Some(HealthStatus::Unhealthy)
            }
            RecoveryKind::MemoryTrim => matches!(
                snapshot.component_status(SYSTEM_COMPONENT),
                Some(HealthStatus::Degraded | HealthStatus::Unhealthy)
            ),
        }
    }

    pub fn default_name(&self) -> String {
        match self {
            RecoveryKind::QueueRebuild => "queue_recovery".to_string(),
            RecoveryKind::StorageRestore => "storage_recovery".to_string(),
            RecoveryKind::ServiceReinit { service } => format!("{}_recovery", service),
            RecoveryKind::MemoryTrim => "memory_cleanup".to_string(),
        }
    }

    pub fn default_cooldown(&self) -> Duration {
        match self {
            RecoveryKind::QueueRebuild => Duration::from_secs(5 * 60),
            RecoveryKind::StorageRestore => Duration::from_secs(10 * 60),
            RecoveryKind::ServiceReinit { .. } => Duration::from_secs(15 * 60),
            RecoveryKind::MemoryTrim => Duration::from_secs(5 * 60),
        }
    }
}

/// Result of one execution of an effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Succeeded(String),
    Failed(String),
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Succeeded(_))
    }
}

/// A registered recovery action.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub name: String,
    pub kind: RecoveryKind,
    pub cooldown: Duration,
    pub last_executed: Option<DateTime<Utc>>,
    pub executions: u64,
    pub failures: u64,
    pub last_outcome: Option<RecoveryOutcome>,
}

impl RecoveryAction {
    /// Creates an action with the kind's default name and cooldown.
    pub fn new(kind: RecoveryKind) -> Self {
        Self {
            name: kind.default_name(),
            cooldown: kind.default_cooldown(),
            kind,
            last_executed: None,
            executions: 0,
            failures: 0,
            last_outcome: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Time left before the action may run again. Zero if never executed.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.last_executed {
            Some(last) => self.cooldown.saturating_sub(duration_since(now, last)),
            None => Duration::ZERO,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        !self.cooldown_remaining(now).is_zero()
    }
}

/// Per-action view returned by `recovery_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub name: String,
    pub kind: RecoveryKind,
    pub last_executed: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: u64,
    pub executions: u64,
    pub failures: u64,
    pub last_outcome: Option<RecoveryOutcome>,
}

/// The default action set: queue, storage and memory, plus one reinit
/// action per external service.
pub fn default_actions<'a>(services: impl IntoIterator<Item = &'a str>) -> Vec<RecoveryAction> {
    let mut actions = vec![
        RecoveryAction::new(RecoveryKind::QueueRebuild),
        RecoveryAction::new(RecoveryKind::StorageRestore),
    ];
    actions.extend(services.into_iter().map(|service| {
        RecoveryAction::new(RecoveryKind::ServiceReinit {
            service: service.to_string(),
        })
    }));
    actions.push(RecoveryAction::new(RecoveryKind::MemoryTrim));
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentHealth;
    use std::collections::BTreeMap;

    fn snapshot(entries: &[(&str, HealthStatus)]) -> HealthSnapshot {
        let now = Utc::now();
        let components: BTreeMap<String, ComponentHealth> = entries
            .iter()
            .map(|(name, status)| {
                let mut health = ComponentHealth::healthy(now);
                health.status = *status;
                (name.to_string(), health)
            })
            .collect();
        HealthSnapshot::new(components, now)
    }

    #[test]
    fn test_conditions() {
        let s = snapshot(&[
            (QUEUE_COMPONENT, HealthStatus::Degraded),
            (STORAGE_COMPONENT, HealthStatus::Unhealthy),
            (SYSTEM_COMPONENT, HealthStatus::Degraded),
            ("publisher", HealthStatus::Unhealthy),
        ]);
        assert!(!RecoveryKind::QueueRebuild.condition_met(&s));
        assert!(RecoveryKind::StorageRestore.condition_met(&s));
        assert!(RecoveryKind::MemoryTrim.condition_met(&s));
        assert!(RecoveryKind::ServiceReinit {
            service: "publisher".to_string()
        }
        .condition_met(&s));
        assert!(!RecoveryKind::ServiceReinit {
            service: "scraper".to_string()
        }
        .condition_met(&s));
    }

    #[test]
    fn test_defaults() {
        let actions = default_actions(["publisher"]);
        let names: Vec<_> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "queue_recovery",
                "storage_recovery",
                "publisher_recovery",
                "memory_cleanup"
            ]
        );
        assert_eq!(actions[1].cooldown, Duration::from_secs(600));
        assert_eq!(actions[2].cooldown, Duration::from_secs(900));
    }

    #[test]
    fn test_cooldown_remaining() {
        let now = Utc::now();
        let mut action = RecoveryAction::new(RecoveryKind::MemoryTrim);
        assert!(!action.is_cooling_down(now));

        action.last_executed = Some(now);
        assert_eq!(
            action.cooldown_remaining(now + chrono::Duration::seconds(60)),
            Duration::from_secs(240)
        );
        assert!(!action.is_cooling_down(now + chrono::Duration::seconds(300)));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_value(RecoveryKind::ServiceReinit {
            service: "publisher".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["kind"], "service_reinit");
        assert_eq!(json["service"], "publisher");
    }
}
