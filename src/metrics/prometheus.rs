//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the sentinel and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all sentinel metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task lifecycle events, labeled by task type and outcome
/// (enqueued, rejected, completed, retried, failed).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution time in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks in the pending set.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of tasks currently in flight.
pub static TASKS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Rate-limit admission decisions, labeled by key and outcome (admitted/rejected).
pub static RATE_LIMIT_CHECKS: OnceLock<CounterVec> = OnceLock::new();

/// Alerts raised, labeled by alert type and severity.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Recovery action executions, labeled by action and outcome (success/failure).
pub static RECOVERY_ACTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Overall health status: 1 healthy, 0.5 degraded, 0 unhealthy.
pub static HEALTH_STATUS: OnceLock<Gauge> = OnceLock::new();

/// Duration of a full health check in seconds.
pub static HEALTH_CHECK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Subsequent
/// calls are no-ops as far as the global statics are concerned.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Queue metrics
    let tasks_total = CounterVec::new(
        Opts::new("sentinel_tasks_total", "Task lifecycle events"),
        &["task_type", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sentinel_task_duration_seconds",
            "Handler execution time in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["task_type"],
    )?;

    let queue_depth = Gauge::new("sentinel_queue_depth", "Number of tasks in the pending set")?;

    let tasks_in_flight = Gauge::new(
        "sentinel_tasks_in_flight",
        "Number of tasks currently being processed",
    )?;

    // Rate limit metrics
    let rate_limit_checks = CounterVec::new(
        Opts::new(
            "sentinel_rate_limit_checks_total",
            "Rate-limit admission decisions",
        ),
        &["key", "outcome"],
    )?;

    // Alert metrics
    let alerts_total = CounterVec::new(
        Opts::new("sentinel_alerts_total", "Alerts raised"),
        &["alert_type", "severity"],
    )?;

    // Recovery metrics
    let recovery_actions = CounterVec::new(
        Opts::new(
            "sentinel_recovery_actions_total",
            "Recovery action executions",
        ),
        &["action", "outcome"],
    )?;

    // Health metrics
    let health_status = Gauge::new(
        "sentinel_health_status",
        "Overall health: 1 healthy, 0.5 degraded, 0 unhealthy",
    )?;

    let health_check_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sentinel_health_check_duration_seconds",
            "Duration of a full health check in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_flight.clone()))?;
    registry.register(Box::new(rate_limit_checks.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;
    registry.register(Box::new(recovery_actions.clone()))?;
    registry.register(Box::new(health_status.clone()))?;
    registry.register(Box::new(health_check_duration.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_FLIGHT.set(tasks_in_flight);
    let _ = RATE_LIMIT_CHECKS.set(rate_limit_checks);
    let _ = ALERTS_TOTAL.set(alerts_total);
    let _ = RECOVERY_ACTIONS.set(recovery_actions);
    let _ = HEALTH_STATUS.set(health_status);
    let _ = HEALTH_CHECK_DURATION.set(health_check_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// # Returns
///
/// A string containing all metrics in Prometheus text format. If the registry
/// has not been initialized or encoding fails, returns a comment line saying so.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
