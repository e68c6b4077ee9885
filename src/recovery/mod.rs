//! Condition-triggered recovery actions.
//!
//! Actions are a closed set of [`RecoveryKind`]s, each with a fixed trigger
//! over the latest [`crate::health::HealthSnapshot`] and a per-action cooldown.

pub mod action;
pub mod manager;

pub use action::{default_actions, RecoveryAction, RecoveryKind, RecoveryOutcome, RecoveryStats};
pub use manager::{RecoveryManager, RecoveryReport, SnapshotSource};
