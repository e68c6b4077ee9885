//! Alert notification routes.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{Alert, AlertSeverity};
use crate::error::ServiceError;

/// Delivers an alert somewhere.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), ServiceError>;
}

/// Notifier that writes alerts to the log at a level matching their severity.
/// Critical alerts are additionally marked as pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), ServiceError> {
        match alert.severity {
            AlertSeverity::Info => tracing::info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                "{}", alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                "{}", alert.message
            ),
            AlertSeverity::Error => tracing::error!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                "{}", alert.message
            ),
            AlertSeverity::Critical => page(alert),
        }
        Ok(())
    }
}

/// Pager hook for critical alerts: an `error!` event tagged `page = true`.
fn page(alert: &Alert) {
    tracing::error!(
        alert_id = %alert.id,
        alert_type = %alert.alert_type,
        severity = %alert.severity,
        page = true,
        "CRITICAL: {}", alert.message
    );
}

/// One notifier per severity tier.
#[derive(Clone)]
pub struct NotificationRoutes {
    pub info: Arc<dyn AlertNotifier>,
    pub warning: Arc<dyn AlertNotifier>,
    pub error: Arc<dyn AlertNotifier>,
    pub critical: Arc<dyn AlertNotifier>,
}

impl Default for NotificationRoutes {
    fn default() -> Self {
        Self::uniform(Arc::new(LogNotifier))
    }
}

impl std::fmt::Debug for NotificationRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRoutes").finish_non_exhaustive()
    }
}

impl NotificationRoutes {
    /// Routes every tier to the same notifier.
    pub fn uniform(notifier: Arc<dyn AlertNotifier>) -> Self {
        Self {
            info: Arc::clone(&notifier),
            warning: Arc::clone(&notifier),
            error: Arc::clone(&notifier),
            critical: notifier,
        }
    }

    /// Replaces the notifier of one tier.
    pub fn with_route(mut self, severity: AlertSeverity, notifier: Arc<dyn AlertNotifier>) -> Self {
        match severity {
            AlertSeverity::Info => self.info = notifier,
            AlertSeverity::Warning => self.warning = notifier,
            AlertSeverity::Error => self.error = notifier,
            AlertSeverity::Critical => self.critical = notifier,
        }
        self
    }

    /// Returns the notifier for `severity`.
    pub fn route(&self, severity: AlertSeverity) -> &Arc<dyn AlertNotifier> {
        match severity {
            AlertSeverity::Info => &self.info,
            AlertSeverity::Warning => &self.warning,
            AlertSeverity::Error => &self.error,
            AlertSeverity::Critical => &self.critical,
        }
    }
}
