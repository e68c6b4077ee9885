//! Shared utility functions for the sentinel.
//!
//! This module provides small helpers used across multiple modules,
//! mostly conversions between `std::time` and `chrono` durations.

pub mod time;

pub use time::{duration_since, to_chrono};
