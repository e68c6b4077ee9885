//! Keyed admission control.
//!
//! Each key has its own lock, so admissions on different keys never contend.
//! The key map itself is only write-locked when rules are registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::budget::{Budget, RateLimitRule, RateLimitStrategy};
use crate::error::RateLimitError;
use crate::metrics::MetricsCollector;

/// Key gating outbound publishing calls.
pub const PUBLISH_KEY: &str = "publish";
/// Key gating scraper fetches.
pub const SCRAPING_KEY: &str = "scraping";
/// Key gating content transformation.
pub const PROCESSING_KEY: &str = "processing";

/// Longest single sleep inside `wait_for_availability`.
const MAX_POLL_DELAY: Duration = Duration::from_secs(1);
/// Shortest single sleep inside `wait_for_availability`.
const MIN_POLL_DELAY: Duration = Duration::from_millis(10);

/// Admission rules installed by [`RateLimiter::with_default_rules`].
pub fn default_rules() -> Vec<(&'static str, RateLimitRule)> {
    vec![
        (
            PUBLISH_KEY,
            RateLimitRule::token_bucket(300, Duration::from_secs(15 * 60)),
        ),
        (
            SCRAPING_KEY,
            RateLimitRule::token_bucket(30, Duration::from_secs(60)),
        ),
        (
            PROCESSING_KEY,
            RateLimitRule::fixed_window(50, Duration::from_secs(60)),
        ),
    ]
}

/// Admission counters and budget view for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStats {
    pub key: String,
    pub strategy: RateLimitStrategy,
    pub max_requests: u32,
    pub remaining: u32,
    pub reset_time: Option<DateTime<Utc>>,
    pub admitted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct KeyState {
    rule: RateLimitRule,
    /// Created on first admission check.
    budget: Option<Budget>,
    admitted: u64,
    rejected: u64,
}

impl KeyState {
    fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            budget: None,
            admitted: 0,
            rejected: 0,
        }
    }

    fn budget_mut(&mut self, now: DateTime<Utc>) -> &mut Budget {
        let rule = &self.rule;
        self.budget.get_or_insert_with(|| rule.fresh_budget(now))
    }

    /// Budget as it would look at `now`, without consuming anything.
    fn view(&self, now: DateTime<Utc>) -> Budget {
        let mut budget = self
            .budget
            .clone()
            .unwrap_or_else(|| self.rule.fresh_budget(now));
        budget.refresh(&self.rule, now);
        budget
    }

    fn stats(&self, key: &str, now: DateTime<Utc>) -> KeyStats {
        let view = self.view(now);
        KeyStats {
            key: key.to_string(),
            strategy: self.rule.strategy,
            max_requests: self.rule.max_requests,
            remaining: view.remaining(),
            reset_time: self.budget.as_ref().map(|_| view.reset_time(&self.rule)),
            admitted: self.admitted,
            rejected: self.rejected,
        }
    }
}

/// Multi-strategy rate limiter.
///
/// # Example
///
/// ```ignore
/// use pipeline_sentinel::rate_limit::RateLimiter;
///
/// let limiter = RateLimiter::with_default_rules();
/// if limiter.check_limit("publish")? {
///     // make the outbound call
/// }
/// ```
#[derive(Debug, Default)]
pub struct RateLimiter {
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
    metrics: MetricsCollector,
}

impl RateLimiter {
    /// Creates a limiter with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a limiter with the publish, scraping and processing rules.
    pub fn with_default_rules() -> Self {
        let limiter = Self::new();
        for (key, rule) in default_rules() {
            if let Err(e) = limiter.add_rule(key, rule) {
                tracing::warn!(key = key, error = %e, "Default rate limit rule rejected");
            }
        }
        limiter
    }

    /// Registers or replaces the rule for `key`. Replacing a rule discards the
    /// key's budget and counters.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::InvalidRule` for a zero limit or interval.
    pub fn add_rule(&self, key: &str, rule: RateLimitRule) -> Result<(), RateLimitError> {
        rule.validate(key)?;

        tracing::debug!(
            key = key,
            strategy = %rule.strategy,
            max_requests = rule.max_requests,
            interval_ms = rule.interval.as_millis() as u64,
            "Rate limit rule registered"
        );

        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Arc::new(Mutex::new(KeyState::new(rule))));
        Ok(())
    }

    /// Returns the rule registered for `key`.
    pub fn rule(&self, key: &str) -> Result<RateLimitRule, RateLimitError> {
        let entry = self.entry(key)?;
        let rule = lock_key(&entry).rule.clone();
        Ok(rule)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn entry(&self, key: &str) -> Result<Arc<Mutex<KeyState>>, RateLimitError> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| RateLimitError::UnknownRule(key.to_string()))
    }

    /// Admits one request for `key` if budget remains, consuming one unit.
    ///
    /// Never blocks. A rejection is a normal outcome, not an error.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::UnknownRule` if no rule is registered.
    pub fn check_limit(&self, key: &str) -> Result<bool, RateLimitError> {
        self.check_limit_at(key, Utc::now())
    }

    /// Admission check as of `now`.
    pub fn check_limit_at(&self, key: &str, now: DateTime<Utc>) -> Result<bool, RateLimitError> {
        let entry = self.entry(key)?;
        let admitted = {
            let mut state = lock_key(&entry);
            let rule = state.rule.clone();
            let admitted = state.budget_mut(now).try_acquire(&rule, now);
            if admitted {
                state.admitted += 1;
            } else {
                state.rejected += 1;
            }
            admitted
        };

        self.metrics.record_rate_limit(key, admitted);
        if !admitted {
            tracing::debug!(key = key, "Rate limit reached");
        }

        Ok(admitted)
    }

    /// Polls `check_limit` until admitted or `timeout` elapses.
    ///
    /// Sleeps between polls for the time until the next unit is due, clamped
    /// to 10ms..=1s and to the remaining timeout.
    pub async fn wait_for_availability(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<bool, RateLimitError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.check_limit(key)? {
                return Ok(true);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(key = key, timeout_ms = timeout.as_millis() as u64, "Gave up waiting for rate limit");
                return Ok(false);
            }

            let delay = self
                .time_until_available(key)?
                .clamp(MIN_POLL_DELAY, MAX_POLL_DELAY)
                .min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Time until `key` can admit at least one request.
    pub fn time_until_available(&self, key: &str) -> Result<Duration, RateLimitError> {
        let now = Utc::now();
        let entry = self.entry(key)?;
        let state = lock_key(&entry);
        Ok(state.view(now).time_until_available(&state.rule, now))
    }

    /// Whole units `key` could admit right now, without consuming any.
    pub fn remaining(&self, key: &str) -> Result<u32, RateLimitError> {
        self.remaining_at(key, Utc::now())
    }

    /// Whole units available at `now`.
    pub fn remaining_at(&self, key: &str, now: DateTime<Utc>) -> Result<u32, RateLimitError> {
        let entry = self.entry(key)?;
        let state = lock_key(&entry);
        Ok(state.view(now).remaining())
    }

    /// When the window of `key` resets (fixed window) or its bucket is full
    /// again (token bucket). `None` until the key is first used.
    pub fn reset_time(&self, key: &str) -> Result<Option<DateTime<Utc>>, RateLimitError> {
        let now = Utc::now();
        let entry = self.entry(key)?;
        let state = lock_key(&entry);
        Ok(state
            .budget
            .as_ref()
            .map(|_| state.view(now).reset_time(&state.rule)))
    }

    /// Counters and budget view for `key`.
    pub fn key_stats(&self, key: &str) -> Result<KeyStats, RateLimitError> {
        let entry = self.entry(key)?;
        let state = lock_key(&entry);
        Ok(state.stats(key, Utc::now()))
    }

    /// Counters for every key, sorted by key.
    pub fn all_stats(&self) -> Vec<KeyStats> {
        self.all_stats_at(Utc::now())
    }

    /// Counters for every key as of `now`.
    pub fn all_stats_at(&self, now: DateTime<Utc>) -> Vec<KeyStats> {
        let entries: Vec<(String, Arc<Mutex<KeyState>>)> = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut stats: Vec<KeyStats> = entries
            .iter()
            .map(|(key, entry)| lock_key(entry).stats(key, now))
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Drops every budget. Rules and counters are kept; budgets are recreated
    /// full on next use.
    pub fn clear_budgets(&self) {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        for entry in keys.values() {
            lock_key(entry).budget = None;
        }
        tracing::info!(keys = keys.len(), "Rate limit budgets cleared");
    }
}

fn lock_key(entry: &Mutex<KeyState>) -> MutexGuard<'_, KeyState> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}
