//! Health aggregation across the queue, rate limiter, storage, host and
//! external services.

pub mod api;
pub mod checker;
pub mod probes;
pub mod types;

pub use api::{HealthApi, HealthSummary, LivenessResponse, Readiness, ReadinessResponse};
pub use checker::{HealthChecker, DEFAULT_PROBE_TIMEOUT};
pub use probes::{
    BudgetSource, ExternalService, QueueStatsSource, ResourceSampler, ResourceUsage,
    StorageProbe, SystemSampler,
};
pub use types::{
    ComponentHealth, HealthSnapshot, HealthStatus, HealthThresholds, QUEUE_COMPONENT,
    RATE_LIMITER_COMPONENT, STORAGE_COMPONENT, SYSTEM_COMPONENT,
};
