//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and pull-based text export for
//! queue depth, rate-limit admissions, alerts, recovery outcomes and health.
//!
//! # Example
//!
//! ```ignore
//! use pipeline_sentinel::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_queue_depth(42, 3);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ALERTS_TOTAL, HEALTH_CHECK_DURATION, HEALTH_STATUS, QUEUE_DEPTH, RATE_LIMIT_CHECKS,
    RECOVERY_ACTIONS, REGISTRY, TASKS_IN_FLIGHT, TASKS_TOTAL, TASK_DURATION,
};
