//! Alert rules, alerts and their classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity tier of an alert. Each tier has its own notification route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Condition an alert rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ErrorRate,
    ScrapingFailure,
    PostFailure,
    MemoryUsage,
    ApiHealth,
    RateLimit,
    SystemHealth,
}

impl AlertType {
    /// Stable snake_case name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ErrorRate => "error_rate",
            AlertType::ScrapingFailure => "scraping_failure",
            AlertType::PostFailure => "post_failure",
            AlertType::MemoryUsage => "memory_usage",
            AlertType::ApiHealth => "api_health",
            AlertType::RateLimit => "rate_limit",
            AlertType::SystemHealth => "system_health",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raise an alert of `alert_type` when an observed value reaches `threshold`,
/// at most once per `cooldown`. Rolling counters count events over `time_window`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub time_window: Duration,
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        threshold: f64,
        time_window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            alert_type,
            severity,
            threshold,
            time_window,
            cooldown,
        }
    }

    /// Human-readable description of a breach.
    pub fn message(&self, value: f64) -> String {
        let minutes = self.time_window.as_secs() / 60;
        match self.alert_type {
            AlertType::ErrorRate => {
                format!("High error rate detected: {} errors in {} minutes", value, minutes)
            }
            AlertType::ScrapingFailure => {
                format!("Multiple scraping failures: {} in {} minutes", value, minutes)
            }
            AlertType::PostFailure => {
                format!("Multiple posting failures: {} in {} minutes", value, minutes)
            }
            AlertType::MemoryUsage => format!("High memory usage: {:.1}%", value),
            AlertType::RateLimit => {
                format!("Rate limit reached {} times in {} minutes", value, minutes)
            }
            AlertType::SystemHealth => format!("System health degraded ({} signals)", value),
            AlertType::ApiHealth => format!(
                "Alert: {} threshold ({}) exceeded with value {}",
                self.alert_type, self.threshold, value
            ),
        }
    }
}

/// Rules installed by [`super::AlertManager::with_default_rules`].
pub fn default_rules() -> Vec<AlertRule> {
    const MINUTE: u64 = 60;
    vec![
        AlertRule::new(
            AlertType::ErrorRate,
            AlertSeverity::Error,
            5.0,
            Duration::from_secs(5 * MINUTE),
            Duration::from_secs(15 * MINUTE),
        ),
        AlertRule::new(
            AlertType::ScrapingFailure,
            AlertSeverity::Warning,
            3.0,
            Duration::from_secs(10 * MINUTE),
            Duration::from_secs(30 * MINUTE),
        ),
        AlertRule::new(
            AlertType::PostFailure,
            AlertSeverity::Error,
            3.0,
            Duration::from_secs(10 * MINUTE),
            Duration::from_secs(30 * MINUTE),
        ),
        AlertRule::new(
            AlertType::MemoryUsage,
            AlertSeverity::Warning,
            85.0,
            Duration::from_secs(5 * MINUTE),
            Duration::from_secs(60 * MINUTE),
        ),
        AlertRule::new(
            AlertType::RateLimit,
            AlertSeverity::Warning,
            1.0,
            Duration::from_secs(MINUTE),
            Duration::from_secs(5 * MINUTE),
        ),
        AlertRule::new(
            AlertType::SystemHealth,
            AlertSeverity::Critical,
            1.0,
            Duration::from_secs(MINUTE),
            Duration::from_secs(15 * MINUTE),
        ),
    ]
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Observed value that breached the threshold.
    pub value: f64,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub(crate) fn raise(rule: &AlertRule, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: rule.alert_type,
            severity: rule.severity,
            message: rule.message(value),
            timestamp: now,
            value,
            resolved: false,
            resolved_at: None,
        }
    }
}
