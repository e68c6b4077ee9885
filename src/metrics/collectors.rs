//! Custom metric collectors for sentinel operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the events each component reports. Every method is a
//! no-op until [`super::init_metrics`] has run.

use super::prometheus::{
    ALERTS_TOTAL, HEALTH_CHECK_DURATION, HEALTH_STATUS, QUEUE_DEPTH, RATE_LIMIT_CHECKS,
    RECOVERY_ACTIONS, TASKS_IN_FLIGHT, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording sentinel operational metrics.
///
/// # Example
///
/// ```ignore
/// use pipeline_sentinel::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task("transform", "completed");
/// collector.record_rate_limit("publish", false);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a task lifecycle event.
    ///
    /// # Arguments
    ///
    /// * `task_type` - Type tag of the task
    /// * `outcome` - One of "enqueued", "rejected", "completed", "retried", "failed"
    pub fn record_task(&self, task_type: &str, outcome: &str) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[task_type, outcome]).inc();
        }

        tracing::trace!(
            task_type = task_type,
            outcome = outcome,
            "Recorded task metric"
        );
    }

    /// Record how long a handler spent on a task.
    pub fn record_task_duration(&self, task_type: &str, duration_secs: f64) {
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type])
                .observe(duration_secs);
        }
    }

    /// Update the pending depth and in-flight gauges.
    pub fn update_queue_depth(&self, pending: usize, in_flight: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(pending as f64);
        }

        if let Some(tasks_in_flight) = TASKS_IN_FLIGHT.get() {
            tasks_in_flight.set(in_flight as f64);
        }
    }

    /// Record a rate-limit admission decision.
    pub fn record_rate_limit(&self, key: &str, admitted: bool) {
        let outcome = if admitted { "admitted" } else { "rejected" };

        if let Some(checks) = RATE_LIMIT_CHECKS.get() {
            checks.with_label_values(&[key, outcome]).inc();
        }
    }

    /// Record a raised alert.
    pub fn record_alert(&self, alert_type: &str, severity: &str) {
        if let Some(alerts_total) = ALERTS_TOTAL.get() {
            alerts_total
                .with_label_values(&[alert_type, severity])
                .inc();
        }

        tracing::trace!(
            alert_type = alert_type,
            severity = severity,
            "Recorded alert metric"
        );
    }

    /// Record the outcome of a recovery action.
    pub fn record_recovery(&self, action: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };

        if let Some(recovery_actions) = RECOVERY_ACTIONS.get() {
            recovery_actions
                .with_label_values(&[action, outcome])
                .inc();
        }
    }

    /// Record a completed health check.
    ///
    /// # Arguments
    ///
    /// * `score` - 1.0 healthy, 0.5 degraded, 0.0 unhealthy
    /// * `duration_secs` - Time the check took
    pub fn record_health_check(&self, score: f64, duration_secs: f64) {
        if let Some(status) = HEALTH_STATUS.get() {
            status.set(score);
        }

        if let Some(duration) = HEALTH_CHECK_DURATION.get() {
            duration.observe(duration_secs);
        }
    }
}
