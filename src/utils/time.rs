//! Conversions between `std::time::Duration` and `chrono::Duration`.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Upper bound used when a std duration does not fit a chrono duration.
const MAX_CHRONO_DAYS: i64 = 365 * 100;

/// Converts a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(MAX_CHRONO_DAYS))
}

/// Returns the non-negative elapsed time from `earlier` to `now`.
///
/// Clock skew that would make the result negative yields `Duration::ZERO`.
pub fn duration_since(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}
