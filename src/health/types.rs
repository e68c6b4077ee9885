//! Health status types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rate_limit::PUBLISH_KEY;

/// Component name of the task queue.
pub const QUEUE_COMPONENT: &str = "queue";
/// Component name of the rate limiter.
pub const RATE_LIMITER_COMPONENT: &str = "rateLimiter";
/// Component name of durable storage.
pub const STORAGE_COMPONENT: &str = "storage";
/// Component name of the host process.
pub const SYSTEM_COMPONENT: &str = "system";

/// Health of a component. Ordered so that the worse status compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value: 1 healthy, 0.5 degraded, 0 unhealthy.
    pub fn score(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ComponentHealth {
    pub fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            last_check: now,
            details: serde_json::Value::Null,
        }
    }

    pub fn degraded(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: now,
            details: serde_json::Value::Null,
        }
    }

    pub fn unhealthy(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            last_check: now,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Moves to a worse status with a new message. Never improves the status.
    pub fn escalate(&mut self, status: HealthStatus, message: impl Into<String>) {
        if status >= self.status {
            self.status = status;
            self.message = Some(message.into());
        }
    }
}

/// Immutable aggregate of component health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Worst status among the components.
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthSnapshot {
    /// Builds a snapshot, deriving the overall status as the worst component
    /// status. An empty component set is healthy.
    pub fn new(components: BTreeMap<String, ComponentHealth>, timestamp: DateTime<Utc>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            timestamp,
            components,
        }
    }

    /// Returns the status of a named component.
    pub fn component_status(&self, name: &str) -> Option<HealthStatus> {
        self.components.get(name).map(|c| c.status)
    }
}

/// Fixed thresholds used to grade components.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Pending depth above which the queue is degraded.
    pub queue_depth_degraded: usize,
    /// Retained failed tasks above which the queue is unhealthy.
    pub failed_tasks_unhealthy: usize,
    /// Memory usage percentage above which the system is degraded.
    pub memory_percent_degraded: f64,
    /// CPU usage percentage above which the system is degraded.
    pub cpu_percent_degraded: f64,
    /// Remaining budget below which a watched rate-limit key is degraded.
    pub rate_limit_low_watermark: u32,
    /// Rate-limit keys whose remaining budget is graded.
    pub watched_rate_limit_keys: Vec<String>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_depth_degraded: 1000,
            failed_tasks_unhealthy: 50,
            memory_percent_degraded: 90.0,
            cpu_percent_degraded: 80.0,
            rate_limit_low_watermark: 10,
            watched_rate_limit_keys: vec![PUBLISH_KEY.to_string()],
        }
    }
}
