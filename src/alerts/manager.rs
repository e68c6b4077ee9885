//! Threshold-based alert manager.
//!
//! A rule raises an alert when an observed value reaches its threshold, then
//! stays silent for its cooldown. Values come either straight from callers
//! through `check_condition`, or from per-type rolling event counters fed by
//! `record_event`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::notifier::NotificationRoutes;
use super::types::{default_rules, Alert, AlertRule, AlertType};
use crate::error::AlertError;
use crate::metrics::MetricsCollector;
use crate::utils::{duration_since, to_chrono};

#[derive(Debug, Default)]
struct AlertState {
    /// Every raised alert inside the history window, oldest first.
    alerts: VecDeque<Alert>,
    last_alert: HashMap<AlertType, DateTime<Utc>>,
    events: HashMap<AlertType, VecDeque<DateTime<Utc>>>,
}

/// Raises, dispatches and resolves alerts.
#[derive(Debug)]
pub struct AlertManager {
    rules: RwLock<HashMap<AlertType, AlertRule>>,
    state: Mutex<AlertState>,
    routes: NotificationRoutes,
    history_window: Duration,
    metrics: MetricsCollector,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

impl AlertManager {
    /// Creates a manager with no rules, logging notifications, and the given
    /// history window.
    pub fn new(history_window: Duration) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            state: Mutex::new(AlertState::default()),
            routes: NotificationRoutes::default(),
            history_window,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a manager with the built-in rules.
    pub fn with_default_rules(history_window: Duration) -> Self {
        let manager = Self::new(history_window);
        for rule in default_rules() {
            manager.add_rule(rule);
        }
        manager
    }

    /// Replaces the notification routes.
    pub fn with_routes(mut self, routes: NotificationRoutes) -> Self {
        self.routes = routes;
        self
    }

    /// Registers or replaces the rule for its alert type.
    pub fn add_rule(&self, rule: AlertRule) {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rule.alert_type, rule);
    }

    /// Returns the rule for `alert_type`.
    pub fn rule(&self, alert_type: AlertType) -> Result<AlertRule, AlertError> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&alert_type)
            .cloned()
            .ok_or_else(|| AlertError::UnknownRule(alert_type.to_string()))
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evaluates `value` against the rule for `alert_type`.
    ///
    /// Returns the raised alert, or `None` when the rule is cooling down or the
    /// value is below threshold.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::UnknownRule` if no rule is registered.
    pub async fn check_condition(
        &self,
        alert_type: AlertType,
        value: f64,
    ) -> Result<Option<Alert>, AlertError> {
        self.check_condition_at(alert_type, value, Utc::now()).await
    }

    /// Evaluates `value` as of `now`.
    pub async fn check_condition_at(
        &self,
        alert_type: AlertType,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertError> {
        let rule = self.rule(alert_type)?;

        let alert = {
            let mut state = self.lock();
            Self::evaluate(&mut state, &rule, value, now)
        };

        if let Some(alert) = &alert {
            self.dispatch(alert).await;
        }

        Ok(alert)
    }

    /// Records one occurrence of `alert_type` and evaluates the number of
    /// occurrences inside the rule's time window.
    pub async fn record_event(&self, alert_type: AlertType) -> Result<Option<Alert>, AlertError> {
        self.record_event_at(alert_type, Utc::now()).await
    }

    /// Records one occurrence as of `now`.
    pub async fn record_event_at(
        &self,
        alert_type: AlertType,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertError> {
        let rule = self.rule(alert_type)?;

        let alert = {
            let mut state = self.lock();
            let cutoff = now - to_chrono(rule.time_window);
            let events = state.events.entry(alert_type).or_default();
            events.push_back(now);
            while events.front().is_some_and(|t| *t <= cutoff) {
                events.pop_front();
            }
            let count = events.len() as f64;
            Self::evaluate(&mut state, &rule, count, now)
        };

        if let Some(alert) = &alert {
            self.dispatch(alert).await;
        }

        Ok(alert)
    }

    /// Number of recorded occurrences of `alert_type` inside its window.
    pub fn event_count_at(&self, alert_type: AlertType, now: DateTime<Utc>) -> usize {
        let Ok(rule) = self.rule(alert_type) else {
            return 0;
        };
        let cutoff = now - to_chrono(rule.time_window);
        self.lock()
            .events
            .get(&alert_type)
            .map_or(0, |events| events.iter().filter(|t| **t > cutoff).count())
    }

    fn evaluate(
        state: &mut AlertState,
        rule: &AlertRule,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        if let Some(last) = state.last_alert.get(&rule.alert_type) {
            if duration_since(now, *last) < rule.cooldown {
                return None;
            }
        }

        if value < rule.threshold {
            return None;
        }

        let alert = Alert::raise(rule, value, now);
        state.last_alert.insert(rule.alert_type, now);
        state.alerts.push_back(alert.clone());
        Some(alert)
    }

    async fn dispatch(&self, alert: &Alert) {
        self.metrics
            .record_alert(alert.alert_type.as_str(), &alert.severity.to_string());

        tracing::info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            value = alert.value,
            "Alert triggered"
        );

        if let Err(e) = self.routes.route(alert.severity).notify(alert).await {
            tracing::error!(
                alert_id = %alert.id,
                error = %e,
                "Alert notification failed"
            );
        }
    }

    /// Marks an alert resolved. Returns whether this call resolved it;
    /// resolving an already resolved or unknown alert does nothing.
    pub fn resolve_alert(&self, alert_id: Uuid) -> bool {
        self.resolve_alert_at(alert_id, Utc::now())
    }

    /// Marks an alert resolved as of `now`.
    pub fn resolve_alert_at(&self, alert_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let Some(alert) = state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id && !a.resolved)
        else {
            return false;
        };

        alert.resolved = true;
        alert.resolved_at = Some(now);
        tracing::info!(alert_id = %alert_id, alert_type = %alert.alert_type, "Alert resolved");
        true
    }

    /// Resolves every active alert of `alert_type`. Returns how many were resolved.
    pub fn resolve_type(&self, alert_type: AlertType) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let mut resolved = 0;
        for alert in state
            .alerts
            .iter_mut()
            .filter(|a| a.alert_type == alert_type && !a.resolved)
        {
            alert.resolved = true;
            alert.resolved_at = Some(now);
            resolved += 1;
        }
        if resolved > 0 {
            tracing::info!(alert_type = %alert_type, resolved = resolved, "Alerts resolved");
        }
        resolved
    }

    /// Unresolved alerts, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Alerts raised within `look_back` of now, resolved or not.
    pub fn alert_history(&self, look_back: Duration) -> Vec<Alert> {
        self.alert_history_at(look_back, Utc::now())
    }

    /// Alerts raised within `look_back` of `now`. The look-back is capped at
    /// the history window.
    pub fn alert_history_at(&self, look_back: Duration, now: DateTime<Utc>) -> Vec<Alert> {
        let cutoff = now - to_chrono(look_back.min(self.history_window));
        self.lock()
            .alerts
            .iter()
            .filter(|a| a.timestamp > cutoff)
            .cloned()
            .collect()
    }

    /// Drops alerts raised before the history window, and event timestamps
    /// older than their rule's window. Returns alerts dropped.
    pub fn prune_history(&self) -> usize {
        self.prune_history_at(Utc::now())
    }

    /// Prunes as of `now`. Alerts still unresolved when they leave the window
    /// are dropped too.
    pub fn prune_history_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.history_window);
        let windows: HashMap<AlertType, Duration> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(t, r)| (*t, r.time_window))
            .collect();

        let mut state = self.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| a.timestamp > cutoff);

        for (alert_type, events) in state.events.iter_mut() {
            let window = windows.get(alert_type).copied().unwrap_or(Duration::ZERO);
            let event_cutoff = now - to_chrono(window);
            events.retain(|t| *t > event_cutoff);
        }

        let dropped = before - state.alerts.len();
        if dropped > 0 {
            tracing::debug!(dropped = dropped, "Alert history pruned");
        }
        dropped
    }
}
