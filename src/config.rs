//! Sentinel configuration.
//!
//! This module provides configuration for the resilient task-processing core:
//! queue capacity and retry policy, storage paths and backup cadence, poll
//! intervals for the health and recovery loops, and health thresholds.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::health::HealthThresholds;
use crate::queue::QueueConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a [`crate::sentinel::Sentinel`].
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    // Queue settings
    /// Capacity, retry and retention policy for the task queue.
    pub queue: QueueConfig,

    // Storage settings
    /// Directory holding the queue snapshot and its backups.
    pub storage_dir: PathBuf,
    /// Number of backups kept after each backup run.
    pub max_backups: usize,
    /// How often a timestamped backup is written.
    pub backup_interval: Duration,
    /// How often the live queue is snapshotted to storage.
    pub snapshot_interval: Duration,

    // Loop settings
    /// Health poll interval.
    pub health_interval: Duration,
    /// Recovery scan interval.
    pub recovery_interval: Duration,

    // Health settings
    /// Thresholds used to grade component health.
    pub thresholds: HealthThresholds,

    // Alert settings
    /// Look-back window retained for alert history.
    pub alert_history: Duration,

    // Worker settings
    /// Number of workers consuming the queue.
    pub num_workers: usize,
    /// Maximum time a handler may spend on a single task.
    pub task_timeout: Duration,
    /// Maximum time a worker waits for rate-limit admission.
    pub admission_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),

            storage_dir: PathBuf::from("storage/queue"),
            max_backups: 10,
            backup_interval: Duration::from_secs(300), // 5 minutes
            snapshot_interval: Duration::from_secs(30),

            health_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),

            thresholds: HealthThresholds::default(),

            alert_history: Duration::from_secs(24 * 3600),

            num_workers: 2,
            task_timeout: Duration::from_secs(300),
            admission_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SentinelConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SENTINEL_QUEUE_MAX_PENDING`: Pending task capacity (default: 1000)
    /// - `SENTINEL_QUEUE_MAX_ATTEMPTS`: Default attempts per task (default: 3)
    /// - `SENTINEL_QUEUE_RETRY_BASE_MS`: Retry backoff base (default: 5000)
    /// - `SENTINEL_QUEUE_RETRY_CAP_MS`: Retry backoff cap (default: 3600000)
    /// - `SENTINEL_QUEUE_RETENTION_SECS`: Terminal task retention (default: 86400)
    /// - `SENTINEL_STORAGE_DIR`: Storage directory (default: storage/queue)
    /// - `SENTINEL_MAX_BACKUPS`: Backups to keep (default: 10)
    /// - `SENTINEL_BACKUP_INTERVAL_SECS`: Backup cadence (default: 300)
    /// - `SENTINEL_SNAPSHOT_INTERVAL_SECS`: Snapshot cadence (default: 30)
    /// - `SENTINEL_HEALTH_INTERVAL_SECS`: Health poll interval (default: 60)
    /// - `SENTINEL_RECOVERY_INTERVAL_SECS`: Recovery scan interval (default: 30)
    /// - `SENTINEL_ALERT_HISTORY_HOURS`: Alert history window (default: 24)
    /// - `SENTINEL_WORKERS`: Number of queue workers (default: 2)
    /// - `SENTINEL_TASK_TIMEOUT_SECS`: Handler timeout (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Queue settings
        if let Ok(val) = std::env::var("SENTINEL_QUEUE_MAX_PENDING") {
            config.queue.max_pending = parse_env_value(&val, "SENTINEL_QUEUE_MAX_PENDING")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_QUEUE_MAX_ATTEMPTS") {
            config.queue.default_max_attempts =
                parse_env_value(&val, "SENTINEL_QUEUE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_QUEUE_RETRY_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "SENTINEL_QUEUE_RETRY_BASE_MS")?;
            config.queue.retry_base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("SENTINEL_QUEUE_RETRY_CAP_MS") {
            let ms: u64 = parse_env_value(&val, "SENTINEL_QUEUE_RETRY_CAP_MS")?;
            config.queue.retry_cap = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("SENTINEL_QUEUE_RETENTION_SECS") {
            let secs: u64 = parse_env_value(&val, "SENTINEL_QUEUE_RETENTION_SECS")?;
            config.queue.terminal_retention = Duration::from_secs(secs);
        }

        // Storage settings
        if let Ok(val) = std::env::var("SENTINEL_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SENTINEL_MAX_BACKUPS") {
            config.max_backups = parse_env_value(&val, "SENTINEL_MAX_BACKUPS")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_BACKUP_INTERVAL_SECS") {
            config.backup_interval = parse_env_secs(&val, "SENTINEL_BACKUP_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval = parse_env_secs(&val, "SENTINEL_SNAPSHOT_INTERVAL_SECS")?;
        }

        // Loop settings
        if let Ok(val) = std::env::var("SENTINEL_HEALTH_INTERVAL_SECS") {
            config.health_interval = parse_env_secs(&val, "SENTINEL_HEALTH_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_RECOVERY_INTERVAL_SECS") {
            config.recovery_interval = parse_env_secs(&val, "SENTINEL_RECOVERY_INTERVAL_SECS")?;
        }

        // Alert settings
        if let Ok(val) = std::env::var("SENTINEL_ALERT_HISTORY_HOURS") {
            let hours: u64 = parse_env_value(&val, "SENTINEL_ALERT_HISTORY_HOURS")?;
            config.alert_history = Duration::from_secs(hours * 3600);
        }

        // Worker settings
        if let Ok(val) = std::env::var("SENTINEL_WORKERS") {
            config.num_workers = parse_env_value(&val, "SENTINEL_WORKERS")?;
        }

        if let Ok(val) = std::env::var("SENTINEL_TASK_TIMEOUT_SECS") {
            config.task_timeout = parse_env_secs(&val, "SENTINEL_TASK_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_pending == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.max_pending must be greater than 0".to_string(),
            ));
        }

        if self.queue.default_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.default_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.queue.retry_base > self.queue.retry_cap {
            return Err(ConfigError::ValidationFailed(
                "queue.retry_base cannot exceed queue.retry_cap".to_string(),
            ));
        }

        for (name, interval) in [
            ("health_interval", self.health_interval),
            ("recovery_interval", self.recovery_interval),
            ("snapshot_interval", self.snapshot_interval),
            ("backup_interval", self.backup_interval),
            ("task_timeout", self.task_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_backups == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_backups must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.thresholds.memory_percent_degraded) {
            return Err(ConfigError::ValidationFailed(
                "thresholds.memory_percent_degraded must be between 0 and 100".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.thresholds.cpu_percent_degraded) {
            return Err(ConfigError::ValidationFailed(
                "thresholds.cpu_percent_degraded must be between 0 and 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Builder method to set the storage directory.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Builder method to set the number of backups kept.
    pub fn with_max_backups(mut self, max: usize) -> Self {
        self.max_backups = max;
        self
    }

    /// Builder method to set the health poll interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Builder method to set the recovery scan interval.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Builder method to set the snapshot interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Builder method to set the backup interval.
    pub fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }

    /// Builder method to set health thresholds.
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the handler timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_env_value(value, key)?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SentinelConfig::default();
        assert_eq!(config.queue.max_pending, 1000);
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.queue.retry_base, Duration::from_millis(5000));
        assert_eq!(config.storage_dir, PathBuf::from("storage/queue"));
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.backup_interval, Duration::from_secs(300));
        assert_eq!(config.health_interval, Duration::from_secs(60));
        assert_eq!(config.recovery_interval, Duration::from_secs(30));
        assert_eq!(config.thresholds.queue_depth_degraded, 1000);
        assert_eq!(config.thresholds.failed_tasks_unhealthy, 50);
    }

    #[test]
    fn test_config_builder() {
        let config = SentinelConfig::new()
            .with_storage_dir("/tmp/sentinel")
            .with_max_backups(3)
            .with_health_interval(Duration::from_secs(5))
            .with_recovery_interval(Duration::from_secs(7))
            .with_workers(8);

        assert_eq!(config.storage_dir, PathBuf::from("/tmp/sentinel"));
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.health_interval, Duration::from_secs(5));
        assert_eq!(config.recovery_interval, Duration::from_secs(7));
        assert_eq!(config.num_workers, 8);
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(SentinelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_interval() {
        let config = SentinelConfig::default().with_health_interval(Duration::ZERO);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("health_interval"));
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut config = SentinelConfig::default();
        config.queue.max_pending = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("max_pending"));
    }

    #[test]
    fn test_validation_retry_base_above_cap() {
        let mut config = SentinelConfig::default();
        config.queue.retry_base = Duration::from_secs(10);
        config.queue.retry_cap = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_threshold_out_of_range() {
        let mut config = SentinelConfig::default();
        config.thresholds.cpu_percent_degraded = 150.0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cpu_percent"));
    }

    #[test]
    fn test_parse_env_value_error() {
        let result: Result<u32, _> = parse_env_value("abc", "SENTINEL_WORKERS");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("SENTINEL_WORKERS"));
    }
}
