//! Rate-limit rules and per-key budgets.
//!
//! Budgets are pure state machines over explicit timestamps. Locking and
//! key lookup live in [`super::RateLimiter`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;
use crate::utils::{duration_since, to_chrono};

/// Admission algorithm of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Hard budget that resets at fixed boundaries.
    FixedWindow,
    /// Continuous refill with burst capacity.
    TokenBucket,
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitStrategy::FixedWindow => write!(f, "fixed_window"),
            RateLimitStrategy::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// Admission rule for one key: `max_requests` per `interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub interval: Duration,
    pub strategy: RateLimitStrategy,
}

impl RateLimitRule {
    /// Creates a fixed-window rule.
    pub fn fixed_window(max_requests: u32, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
            strategy: RateLimitStrategy::FixedWindow,
        }
    }

    /// Creates a token-bucket rule.
    pub fn token_bucket(max_requests: u32, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
            strategy: RateLimitStrategy::TokenBucket,
        }
    }

    /// Rejects rules that could never admit a request.
    pub fn validate(&self, key: &str) -> Result<(), RateLimitError> {
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidRule {
                key: key.to_string(),
                reason: "max_requests must be greater than 0".to_string(),
            });
        }
        if self.interval.is_zero() {
            return Err(RateLimitError::InvalidRule {
                key: key.to_string(),
                reason: "interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Tokens refilled per millisecond.
    fn refill_rate(&self) -> f64 {
        f64::from(self.max_requests) / (self.interval.as_secs_f64() * 1000.0)
    }

    /// Creates a full budget starting at `now`.
    pub fn fresh_budget(&self, now: DateTime<Utc>) -> Budget {
        match self.strategy {
            RateLimitStrategy::FixedWindow => Budget::FixedWindow {
                remaining: self.max_requests,
                reset_time: now + to_chrono(self.interval),
            },
            RateLimitStrategy::TokenBucket => Budget::TokenBucket {
                tokens: f64::from(self.max_requests),
                last_refill: now,
            },
        }
    }
}

/// Admission state of one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Budget {
    FixedWindow {
        remaining: u32,
        reset_time: DateTime<Utc>,
    },
    TokenBucket {
        tokens: f64,
        last_refill: DateTime<Utc>,
    },
}

impl Budget {
    /// Brings the budget up to date with `now`.
    ///
    /// A fixed window that has expired resets to full, with its boundary
    /// advanced by whole intervals so it stays aligned. A bucket gains tokens
    /// in proportion to elapsed time, capped at the rule maximum.
    pub fn refresh(&mut self, rule: &RateLimitRule, now: DateTime<Utc>) {
        match self {
            Budget::FixedWindow {
                remaining,
                reset_time,
            } => {
                if now >= *reset_time {
                    let interval_ms = rule.interval.as_millis().max(1);
                    let overdue_ms = duration_since(now, *reset_time).as_millis();
                    let windows = (overdue_ms / interval_ms + 1).min(u128::from(u32::MAX)) as u32;
                    *remaining = rule.max_requests;
                    *reset_time += to_chrono(rule.interval.saturating_mul(windows));
                }
            }
            Budget::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed_ms = duration_since(now, *last_refill).as_secs_f64() * 1000.0;
                *tokens = (*tokens + elapsed_ms * rule.refill_rate())
                    .min(f64::from(rule.max_requests));
                if now > *last_refill {
                    *last_refill = now;
                }
            }
        }
    }

    /// Refreshes and consumes one unit if available. Returns whether admitted.
    pub fn try_acquire(&mut self, rule: &RateLimitRule, now: DateTime<Utc>) -> bool {
        self.refresh(rule, now);
        match self {
            Budget::FixedWindow { remaining, .. } => {
                if *remaining == 0 {
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            }
            Budget::TokenBucket { tokens, .. } => {
                if *tokens < 1.0 {
                    false
                } else {
                    *tokens -= 1.0;
                    true
                }
            }
        }
    }

    /// Whole units available right now.
    pub fn remaining(&self) -> u32 {
        match self {
            Budget::FixedWindow { remaining, .. } => *remaining,
            Budget::TokenBucket { tokens, .. } => tokens.max(0.0).floor() as u32,
        }
    }

    /// When a fixed window resets, or when a bucket is full again.
    pub fn reset_time(&self, rule: &RateLimitRule) -> DateTime<Utc> {
        match self {
            Budget::FixedWindow { reset_time, .. } => *reset_time,
            Budget::TokenBucket {
                tokens,
                last_refill,
            } => {
                let missing = (f64::from(rule.max_requests) - tokens).max(0.0);
                *last_refill + millis(missing / rule.refill_rate())
            }
        }
    }

    /// Time until at least one unit is available, measured from `now`.
    pub fn time_until_available(&self, rule: &RateLimitRule, now: DateTime<Utc>) -> Duration {
        match self {
            Budget::FixedWindow {
                remaining,
                reset_time,
            } => {
                if *remaining > 0 {
                    Duration::ZERO
                } else {
                    duration_since(*reset_time, now)
                }
            }
            Budget::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(((1.0 - tokens) / rule.refill_rate()).ceil() as u64)
                }
            }
        }
    }
}

fn millis(ms: f64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.ceil() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[test]
    fn test_rule_validation() {
        assert!(RateLimitRule::fixed_window(5, Duration::from_secs(1))
            .validate("k")
            .is_ok());

        let err = RateLimitRule::fixed_window(0, Duration::from_secs(1))
            .validate("k")
            .unwrap_err();
        assert!(err.to_string().contains("max_requests"));

        let err = RateLimitRule::token_bucket(5, Duration::ZERO)
            .validate("k")
            .unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn test_token_bucket_refills_under_sub_millisecond_polling() {
        let rule = RateLimitRule::token_bucket(10, Duration::from_millis(1000));
        let start = Utc::now();
        let mut budget = rule.fresh_budget(start);
        for _ in 0..10 {
            assert!(budget.try_acquire(&rule, start));
        }

        let step = chrono::Duration::microseconds(900);
        let mut admitted = 0;
        let mut at = start;
        for _ in 0..2222 {
            at += step;
            if budget.try_acquire(&rule, at) {
                admitted += 1;
            }
        }

        // 2s of refill at 10 per second.
        assert!((19..=20).contains(&admitted), "admitted {}", admitted);
    }

    #[test]
    fn test_fixed_window_rollover_stays_aligned() {
        let rule = RateLimitRule::fixed_window(2, Duration::from_millis(1000));
        let start = Utc::now();
        let mut budget = rule.fresh_budget(start);

        assert!(budget.try_acquire(&rule, start));
        assert!(budget.try_acquire(&rule, start));
        assert!(!budget.try_acquire(&rule, start + ms(999)));

        // Two and a half windows later the boundary sits at start + 3000ms.
        assert!(budget.try_acquire(&rule, start + ms(2500)));
        assert_eq!(budget.reset_time(&rule), start + ms(3000));
        assert_eq!(budget.remaining(), 1);
    }

    #[test]
    fn test_token_bucket_refills_with_elapsed_time() {
        let rule = RateLimitRule::token_bucket(10, Duration::from_millis(1000));
        let start = Utc::now();
        let mut budget = rule.fresh_budget(start);

        for _ in 0..10 {
            assert!(budget.try_acquire(&rule, start));
        }
        assert!(!budget.try_acquire(&rule, start));
        assert_eq!(
            budget.time_until_available(&rule, start),
            Duration::from_millis(100)
        );

        // 250ms refill 2.5 tokens regardless of how often we look.
        budget.refresh(&rule, start + ms(250));
        assert_eq!(budget.remaining(), 2);

        budget.refresh(&rule, start + ms(60_000));
        assert_eq!(budget.remaining(), 10);
    }

    #[test]
    fn test_token_bucket_reset_time_is_full_time() {
        let rule = RateLimitRule::token_bucket(4, Duration::from_millis(400));
        let start = Utc::now();
        let mut budget = rule.fresh_budget(start);

        assert_eq!(budget.reset_time(&rule), start);
        assert!(budget.try_acquire(&rule, start));
        assert!(budget.try_acquire(&rule, start));
        assert_eq!(budget.reset_time(&rule), start + ms(200));
    }

    #[test]
    fn test_budget_never_negative() {
        let rule = RateLimitRule::fixed_window(1, Duration::from_secs(60));
        let now = Utc::now();
        let mut budget = rule.fresh_budget(now);

        assert!(budget.try_acquire(&rule, now));
        for _ in 0..5 {
            assert!(!budget.try_acquire(&rule, now));
        }
        assert_eq!(budget.remaining(), 0);
    }
}
