//! Payloads served to monitoring collaborators.
//!
//! Only the health payload triggers a check. Liveness never touches a
//! component, and readiness and the summary read the latest snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checker::HealthChecker;
use super::types::{HealthSnapshot, HealthStatus};

/// Liveness probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Readiness probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: Readiness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether each component was healthy in the latest snapshot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Compact view of the latest snapshot. `status` is `"unknown"` before the
/// first check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub status: String,
    pub last_check: Option<DateTime<Utc>>,
    pub components: BTreeMap<String, ComponentSummary>,
}

/// Health endpoints over a shared checker.
#[derive(Debug, Clone)]
pub struct HealthApi {
    checker: Arc<HealthChecker>,
}

impl HealthApi {
    pub fn new(checker: Arc<HealthChecker>) -> Self {
        Self { checker }
    }

    /// Runs a check (or joins the one in progress) and returns the full
    /// snapshot.
    pub async fn health(&self) -> Arc<HealthSnapshot> {
        self.checker.check_health().await
    }

    pub fn liveness(&self) -> LivenessResponse {
        LivenessResponse {
            status: "alive".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let Some(snapshot) = self.checker.latest() else {
            return ReadinessResponse {
                status: Readiness::NotReady,
                message: Some("Health check not performed yet".to_string()),
                components: BTreeMap::new(),
            };
        };

        let status = if snapshot.status == HealthStatus::Healthy {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        ReadinessResponse {
            status,
            message: None,
            components: snapshot
                .components
                .iter()
                .map(|(name, health)| (name.clone(), health.status == HealthStatus::Healthy))
                .collect(),
        }
    }

    pub fn summary(&self) -> HealthSummary {
        match self.checker.latest() {
            Some(snapshot) => HealthSummary {
                status: snapshot.status.to_string(),
                last_check: Some(snapshot.timestamp),
                components: snapshot
                    .components
                    .iter()
                    .map(|(name, health)| {
                        (
                            name.clone(),
                            ComponentSummary {
                                status: health.status,
                                message: health.message.clone(),
                            },
                        )
                    })
                    .collect(),
            },
            None => HealthSummary {
                status: "unknown".to_string(),
                last_check: None,
                components: BTreeMap::new(),
            },
        }
    }
}
