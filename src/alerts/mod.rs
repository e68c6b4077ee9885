//! Threshold-based alerting with per-rule cooldowns.
//!
//! # Example
//!
//! ```ignore
//! use pipeline_sentinel::alerts::{AlertManager, AlertType};
//!
//! let alerts = AlertManager::with_default_rules(std::time::Duration::from_secs(86_400));
//! alerts.record_event(AlertType::PostFailure).await?;
//! for alert in alerts.active_alerts() {
//!     println!("{}: {}", alert.severity, alert.message);
//! }
//! ```

pub mod manager;
pub mod notifier;
pub mod types;

pub use manager::AlertManager;
pub use notifier::{AlertNotifier, LogNotifier, NotificationRoutes};
pub use types::{default_rules, Alert, AlertRule, AlertSeverity, AlertType};
