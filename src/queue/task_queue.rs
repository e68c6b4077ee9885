//! In-memory prioritized task queue with retry lifecycle.
//!
//! The queue owns every task it admits and moves it between three sets:
//!
//! - pending: `Pending` and `Retrying` tasks, ordered by priority, then
//!   eligibility time, then arrival
//! - in flight: tasks handed out by `dequeue_next`
//! - terminal: `Completed` and `Failed` tasks, retained for inspection
//!
//! Every operation runs in a single critical section, so concurrent
//! `dequeue_next` calls never select the same task.
//!
//! Ordering across tiers is strict. A steady stream of high-priority work
//! starves lower tiers; operators control this through the priority mix.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{EnqueueOptions, Task, TaskPriority, TaskStatus};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::utils::{duration_since, to_chrono};

/// Capacity, retry and retention policy for a [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks in the pending set before `enqueue` is refused.
    pub max_pending: usize,
    /// Attempt cap applied when `EnqueueOptions::max_attempts` is unset.
    pub default_max_attempts: u32,
    /// Priority applied when `EnqueueOptions::priority` is unset.
    pub default_priority: TaskPriority,
    /// Base of the exponential retry delay.
    pub retry_base: Duration,
    /// Upper bound on a single retry delay.
    pub retry_cap: Duration,
    /// How long terminal tasks are retained.
    pub terminal_retention: Duration,
    /// Hard cap on retained terminal tasks.
    pub max_terminal_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            default_max_attempts: 3,
            default_priority: TaskPriority::Medium,
            retry_base: Duration::from_millis(5000),
            retry_cap: Duration::from_secs(3600),
            terminal_retention: Duration::from_secs(24 * 3600),
            max_terminal_records: 10_000,
        }
    }
}

impl QueueConfig {
    /// Delay before the next attempt of a task that has failed `attempts` times.
    ///
    /// Computes `retry_base * 2^attempts`, saturating at `retry_cap`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .map_or(self.retry_cap, |delay| delay.min(self.retry_cap))
    }
}

/// Point-in-time counters for a [`TaskQueue`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting for their first attempt.
    pub pending: usize,
    /// Tasks waiting for a retry.
    pub retrying: usize,
    /// Tasks in flight.
    pub processing: usize,
    /// Retained completed tasks.
    pub completed: usize,
    /// Retained failed tasks.
    pub failed: usize,
    /// Size of the pending set (`pending + retrying`).
    pub depth: usize,
    /// Pending-set tasks at HIGH or CRITICAL priority.
    pub high_priority: usize,
    /// Age of the oldest task in the pending set, in milliseconds.
    pub oldest_pending_age_ms: Option<u64>,
    /// Tasks completed since the queue was created.
    pub completed_total: u64,
    /// Tasks failed permanently since the queue was created.
    pub failed_total: u64,
    /// Configured pending capacity.
    pub capacity: usize,
}

impl QueueStats {
    /// Fraction of pending capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.depth as f64 / self.capacity as f64
        }
    }
}

/// Serializable copy of the live (non-terminal) queue contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Pending-set tasks in dequeue order.
    pub pending: Vec<Task>,
    /// In-flight tasks.
    pub in_flight: Vec<Task>,
}

impl QueueSnapshot {
    /// Builds a snapshot from explicit task lists.
    pub fn new(taken_at: DateTime<Utc>, pending: Vec<Task>, in_flight: Vec<Task>) -> Self {
        Self {
            taken_at,
            pending,
            in_flight,
        }
    }

    /// Total number of tasks in the snapshot.
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Returns whether the snapshot holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Checks structural consistency.
    ///
    /// Ids must be unique, attempts must not exceed the cap, pending tasks
    /// must be `Pending` or `Retrying`, and in-flight tasks must be `Processing`.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::with_capacity(self.len());

        for task in self.pending.iter().chain(self.in_flight.iter()) {
            if !seen.insert(task.id) {
                return Err(format!("duplicate task id {}", task.id));
            }
            if task.attempts > task.max_attempts {
                return Err(format!(
                    "task {} has {} attempts, cap is {}",
                    task.id, task.attempts, task.max_attempts
                ));
            }
        }

        if let Some(task) = self.pending.iter().find(|t| !t.status.is_queued()) {
            return Err(format!(
                "pending task {} has status {}",
                task.id, task.status
            ));
        }

        if let Some(task) = self
            .in_flight
            .iter()
            .find(|t| t.status != TaskStatus::Processing)
        {
            return Err(format!(
                "in-flight task {} has status {}",
                task.id, task.status
            ));
        }

        Ok(())
    }
}

/// Ordering key of the pending set. Sorts highest priority first, then earliest
/// eligibility, then earliest creation, then insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    priority: Reverse<TaskPriority>,
    eligible_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl PendingKey {
    fn tier_start(priority: TaskPriority) -> Self {
        Self {
            priority: Reverse(priority),
            eligible_at: DateTime::<Utc>::MIN_UTC,
            created_at: DateTime::<Utc>::MIN_UTC,
            seq: 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<PendingKey, Task>,
    pending_index: HashMap<Uuid, PendingKey>,
    in_flight: HashMap<Uuid, Task>,
    terminal: VecDeque<Task>,
    seq: u64,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    fn insert_pending(&mut self, task: Task) {
        self.seq += 1;
        let key = PendingKey {
            priority: Reverse(task.priority),
            eligible_at: task.eligible_at(),
            created_at: task.created_at,
            seq: self.seq,
        };
        self.pending_index.insert(task.id, key);
        self.pending.insert(key, task);
    }

    /// Finds the first eligible entry, scanning one tier at a time. Within a
    /// tier entries are sorted by eligibility, so only the head needs checking.
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<PendingKey> {
        [
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Medium,
            TaskPriority::Low,
        ]
        .into_iter()
        .find_map(|priority| {
            self.pending
                .range(PendingKey::tier_start(priority)..)
                .next()
                .filter(|(key, _)| key.priority == Reverse(priority) && key.eligible_at <= now)
                .map(|(key, _)| *key)
        })
    }

    fn push_terminal(&mut self, task: Task, max_records: usize) {
        self.terminal.push_back(task);
        while self.terminal.len() > max_records {
            self.terminal.pop_front();
        }
    }

    fn state_of(&self, task_id: Uuid) -> String {
        if self.pending_index.contains_key(&task_id) {
            self.pending_index
                .get(&task_id)
                .and_then(|key| self.pending.get(key))
                .map_or_else(|| "pending".to_string(), |t| t.status.to_string())
        } else if let Some(task) = self.terminal.iter().find(|t| t.id == task_id) {
            task.status.to_string()
        } else {
            "unknown".to_string()
        }
    }

    fn stats(&self, config: &QueueConfig, now: DateTime<Utc>) -> QueueStats {
        let retrying = self
            .pending
            .values()
            .filter(|t| t.status == TaskStatus::Retrying)
            .count();
        let high_priority = self
            .pending
            .values()
            .filter(|t| t.priority >= TaskPriority::High)
            .count();
        let oldest = self.pending.values().map(|t| t.created_at).min();
        let completed = self
            .terminal
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        QueueStats {
            pending: self.pending.len() - retrying,
            retrying,
            processing: self.in_flight.len(),
            completed,
            failed: self.terminal.len() - completed,
            depth: self.pending.len(),
            high_priority,
            oldest_pending_age_ms: oldest
                .map(|created| duration_since(now, created).as_millis() as u64),
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            capacity: config.max_pending,
        }
    }
}

/// In-memory prioritized work list.
///
/// # Example
///
/// ```ignore
/// use pipeline_sentinel::queue::{EnqueueOptions, QueueConfig, TaskPriority, TaskQueue};
///
/// let queue = TaskQueue::new(QueueConfig::default());
/// let id = queue.enqueue(
///     "publish",
///     serde_json::json!({"post": 1}),
///     EnqueueOptions::new().with_priority(TaskPriority::High),
/// )?;
///
/// if let Some(task) = queue.dequeue_next() {
///     queue.complete(task.id)?;
/// }
/// ```
#[derive(Debug)]
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    metrics: MetricsCollector,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave a task in two sets, since
        // each set is updated before the next is touched.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_depth(&self, state: &QueueState) {
        self.metrics
            .update_queue_depth(state.pending.len(), state.in_flight.len());
    }

    /// Admits a new task.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::CapacityExceeded` when the pending set is full.
    pub fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        self.enqueue_at(task_type, payload, options, Utc::now())
    }

    /// Admits a new task as of `now`.
    pub fn enqueue_at(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        let mut state = self.lock();

        if state.pending.len() >= self.config.max_pending {
            drop(state);
            self.metrics.record_task(task_type, "rejected");
            tracing::warn!(
                task_type = task_type,
                max = self.config.max_pending,
                "Queue full, rejecting task"
            );
            return Err(QueueError::CapacityExceeded {
                max: self.config.max_pending,
            });
        }

        let mut task = Task::new(
            task_type,
            payload,
            options.priority.unwrap_or(self.config.default_priority),
            options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts)
                .max(1),
            now,
        );
        task.scheduled_for = options.not_before;
        let id = task.id;
        let priority = task.priority;

        state.insert_pending(task);
        self.publish_depth(&state);
        drop(state);

        self.metrics.record_task(task_type, "enqueued");
        tracing::debug!(
            task_id = %id,
            task_type = task_type,
            priority = %priority,
            "Task enqueued"
        );

        Ok(id)
    }

    /// Hands out the highest-priority eligible task, moving it in flight.
    pub fn dequeue_next(&self) -> Option<Task> {
        self.dequeue_next_at(Utc::now())
    }

    /// Hands out the highest-priority task eligible at `now`.
    pub fn dequeue_next_at(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut state = self.lock();

        let key = state.next_eligible(now)?;
        let mut task = state.pending.remove(&key)?;
        state.pending_index.remove(&task.id);

        task.status = TaskStatus::Processing;
        task.updated_at = now;
        state.in_flight.insert(task.id, task.clone());
        self.publish_depth(&state);
        drop(state);

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            attempt = task.attempts + 1,
            "Task dequeued"
        );

        Some(task)
    }

    /// Marks an in-flight task as completed.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidState` if the task is not in flight.
    pub fn complete(&self, task_id: Uuid) -> Result<Task, QueueError> {
        self.complete_at(task_id, Utc::now())
    }

    /// Marks an in-flight task as completed as of `now`.
    pub fn complete_at(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Task, QueueError> {
        let mut state = self.lock();

        let Some(mut task) = state.in_flight.remove(&task_id) else {
            return Err(QueueError::InvalidState {
                task_id,
                state: state.state_of(task_id),
            });
        };

        task.status = TaskStatus::Completed;
        task.updated_at = now;
        state.completed_total += 1;
        state.push_terminal(task.clone(), self.config.max_terminal_records);
        self.publish_depth(&state);
        drop(state);

        self.metrics.record_task(&task.task_type, "completed");
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts + 1,
            "Task completed"
        );

        Ok(task)
    }

    /// Records a failed attempt of an in-flight task.
    ///
    /// The task is rescheduled with exponential backoff, or marked `Failed`
    /// once it has used all its attempts. Returns the task in its new state.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidState` if the task is not in flight.
    pub fn fail(&self, task_id: Uuid, error: &str) -> Result<Task, QueueError> {
        self.fail_at(task_id, error, Utc::now())
    }

    /// Records a failed attempt as of `now`.
    pub fn fail_at(
        &self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, QueueError> {
        let mut state = self.lock();

        let Some(mut task) = state.in_flight.remove(&task_id) else {
            return Err(QueueError::InvalidState {
                task_id,
                state: state.state_of(task_id),
            });
        };

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.updated_at = now;

        if task.should_retry() {
            let delay = self.config.retry_delay(task.attempts);
            task.status = TaskStatus::Retrying;
            task.scheduled_for = Some(now + to_chrono(delay));
            state.insert_pending(task.clone());
            self.publish_depth(&state);
            drop(state);

            self.metrics.record_task(&task.task_type, "retried");
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = error,
                "Task failed, scheduling retry"
            );
        } else {
            task.status = TaskStatus::Failed;
            state.failed_total += 1;
            state.push_terminal(task.clone(), self.config.max_terminal_records);
            self.publish_depth(&state);
            drop(state);

            self.metrics.record_task(&task.task_type, "failed");
            tracing::error!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempts,
                error = error,
                "Task failed permanently"
            );
        }

        Ok(task)
    }

    /// Returns current counters.
    pub fn stats(&self) -> QueueStats {
        self.stats_at(Utc::now())
    }

    /// Returns counters with ages measured from `now`.
    pub fn stats_at(&self, now: DateTime<Utc>) -> QueueStats {
        self.lock().stats(&self.config, now)
    }

    /// Looks up a task in any set.
    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        let state = self.lock();
        state
            .pending_index
            .get(&task_id)
            .and_then(|key| state.pending.get(key))
            .or_else(|| state.in_flight.get(&task_id))
            .or_else(|| state.terminal.iter().find(|t| t.id == task_id))
            .cloned()
    }

    /// Pending-set tasks in dequeue order (ignoring eligibility).
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.lock().pending.values().cloned().collect()
    }

    /// In-flight tasks.
    pub fn in_flight_tasks(&self) -> Vec<Task> {
        self.lock().in_flight.values().cloned().collect()
    }

    /// Retained terminal tasks, oldest first.
    pub fn terminal_tasks(&self) -> Vec<Task> {
        self.lock().terminal.iter().cloned().collect()
    }

    /// Copies the pending and in-flight sets.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot::new(
            Utc::now(),
            state.pending.values().cloned().collect(),
            state.in_flight.values().cloned().collect(),
        )
    }

    /// Loads a persisted snapshot at cold start, replacing all live state.
    ///
    /// Tasks that were in flight when the snapshot was taken are returned to
    /// the pending set as retries with unchanged attempts, eligible at `now`.
    /// Returns the number of tasks loaded.
    pub fn restore(&self, snapshot: QueueSnapshot, now: DateTime<Utc>) -> usize {
        let mut next = QueueState::default();
        let mut reclaimed = 0usize;

        for task in snapshot.pending {
            next.insert_pending(task);
        }
        for mut task in snapshot.in_flight {
            task.status = TaskStatus::Retrying;
            task.scheduled_for = Some(now);
            task.updated_at = now;
            next.insert_pending(task);
            reclaimed += 1;
        }

        let loaded = next.pending.len();
        let mut state = self.lock();
        next.completed_total = state.completed_total;
        next.failed_total = state.failed_total;
        *state = next;
        self.publish_depth(&state);
        drop(state);

        tracing::info!(
            loaded = loaded,
            reclaimed = reclaimed,
            "Queue restored from snapshot"
        );

        loaded
    }

    /// Rebuilds the pending set from a snapshot while the queue is live.
    ///
    /// The replacement state is built in full before it is swapped in. Tasks
    /// currently in flight stay in flight. Snapshot tasks that were in flight
    /// but are no longer tracked return to the pending set. Terminal records
    /// are preserved. Returns the resulting pending depth.
    pub fn replace_state(&self, snapshot: QueueSnapshot, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();

        let mut next = QueueState {
            seq: state.seq,
            completed_total: state.completed_total,
            failed_total: state.failed_total,
            ..QueueState::default()
        };
        let terminal_ids: std::collections::HashSet<Uuid> =
            state.terminal.iter().map(|t| t.id).collect();

        for task in snapshot.pending {
            if !state.in_flight.contains_key(&task.id) && !terminal_ids.contains(&task.id) {
                next.insert_pending(task);
            }
        }
        for mut task in snapshot.in_flight {
            if state.in_flight.contains_key(&task.id)
                || terminal_ids.contains(&task.id)
                || next.pending_index.contains_key(&task.id)
            {
                continue;
            }
            task.status = TaskStatus::Retrying;
            task.scheduled_for = Some(now);
            task.updated_at = now;
            next.insert_pending(task);
        }

        next.in_flight = std::mem::take(&mut state.in_flight);
        next.terminal = std::mem::take(&mut state.terminal);
        let depth = next.pending.len();
        *state = next;
        self.publish_depth(&state);

        depth
    }

    /// Drops terminal tasks older than the retention window.
    pub fn prune_terminal(&self) -> usize {
        self.prune_terminal_at(Utc::now())
    }

    /// Drops terminal tasks whose last update is older than the retention
    /// window measured from `now`. Returns the number dropped.
    pub fn prune_terminal_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.config.terminal_retention);
        let mut state = self.lock();
        let before = state.terminal.len();
        state.terminal.retain(|t| t.updated_at >= cutoff);
        before - state.terminal.len()
    }

    /// Drops all terminal records and releases spare capacity.
    pub fn trim(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.terminal.len();
        state.terminal.clear();
        state.terminal.shrink_to_fit();
        state.in_flight.shrink_to_fit();
        state.pending_index.shrink_to_fit();
        dropped
    }

    /// Empties the queue, including counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = QueueState::default();
        self.publish_depth(&state);
        tracing::info!("Queue reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(priority: TaskPriority) -> EnqueueOptions {
        EnqueueOptions::new().with_priority(priority)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = QueueConfig {
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_millis(1000),
            ..QueueConfig::default()
        };

        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(800));
        assert_eq!(config.retry_delay(4), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_enqueue_and_dequeue() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        let id = queue
            .enqueue_at("scrape", json!({"url": "a"}), EnqueueOptions::new(), now)
            .expect("enqueue should succeed");

        let task = queue.dequeue_next_at(now).expect("task should be eligible");
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(queue.dequeue_next_at(now).is_none());

        let stats = queue.stats_at(now);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.depth, 0);
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let queue = TaskQueue::default();
        let now = Utc::now();

        let low = queue
            .enqueue_at("t", json!(null), opts(TaskPriority::Low), now)
            .expect("enqueue");
        let high_a = queue
            .enqueue_at("t", json!(null), opts(TaskPriority::High), now + secs(1))
            .expect("enqueue");
        let high_b = queue
            .enqueue_at("t", json!(null), opts(TaskPriority::High), now + secs(2))
            .expect("enqueue");
        let critical = queue
            .enqueue_at("t", json!(null), opts(TaskPriority::Critical), now + secs(3))
            .expect("enqueue");

        let later = now + secs(10);
        let order: Vec<Uuid> = std::iter::from_fn(|| queue.dequeue_next_at(later))
            .map(|t| t.id)
            .collect();

        assert_eq!(order, vec![critical, high_a, high_b, low]);
    }

    #[test]
    fn test_same_instant_keeps_arrival_order() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..5)
            .map(|_| {
                queue
                    .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
                    .expect("enqueue")
            })
            .collect();

        let order: Vec<Uuid> = std::iter::from_fn(|| queue.dequeue_next_at(now))
            .map(|t| t.id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_not_before_skips_ineligible_task() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        queue
            .enqueue_at(
                "t",
                json!(null),
                opts(TaskPriority::Critical).with_not_before(now + secs(60)),
                now,
            )
            .expect("enqueue");
        let low = queue
            .enqueue_at("t", json!(null), opts(TaskPriority::Low), now)
            .expect("enqueue");

        let first = queue.dequeue_next_at(now).expect("low task is eligible");
        assert_eq!(first.id, low);
        assert!(queue.dequeue_next_at(now).is_none());
        assert!(queue.dequeue_next_at(now + secs(60)).is_some());
    }

    #[test]
    fn test_capacity_exceeded() {
        let queue = TaskQueue::new(QueueConfig {
            max_pending: 2,
            ..QueueConfig::default()
        });

        queue.enqueue("t", json!(1), EnqueueOptions::new()).expect("enqueue");
        queue.enqueue("t", json!(2), EnqueueOptions::new()).expect("enqueue");
        let err = queue
            .enqueue("t", json!(3), EnqueueOptions::new())
            .unwrap_err();
        assert!(matches!(err, QueueError::CapacityExceeded { max: 2 }));
    }

    #[test]
    fn test_retry_reinsertion_ignores_capacity() {
        let queue = TaskQueue::new(QueueConfig {
            max_pending: 1,
            ..QueueConfig::default()
        });
        let now = Utc::now();

        queue
            .enqueue_at("t", json!(1), EnqueueOptions::new(), now)
            .expect("enqueue");
        let task = queue.dequeue_next_at(now).expect("dequeue");
        queue
            .enqueue_at("t", json!(2), EnqueueOptions::new(), now)
            .expect("enqueue");

        let failed = queue.fail_at(task.id, "boom", now).expect("fail");
        assert_eq!(failed.status, TaskStatus::Retrying);
        assert_eq!(queue.stats_at(now).depth, 2);
    }

    #[test]
    fn test_fail_retries_then_fails_permanently() {
        let queue = TaskQueue::new(QueueConfig {
            retry_base: Duration::from_millis(1000),
            ..QueueConfig::default()
        });
        let mut now = Utc::now();
        let id = queue
            .enqueue_at(
                "publish",
                json!(null),
                EnqueueOptions::new().with_max_attempts(3),
                now,
            )
            .expect("enqueue");

        for attempt in 1..=2u32 {
            let task = queue.dequeue_next_at(now).expect("eligible");
            let failed = queue.fail_at(task.id, "timeout", now).expect("fail");
            assert_eq!(failed.attempts, attempt);
            assert_eq!(failed.status, TaskStatus::Retrying);

            let scheduled = failed.scheduled_for.expect("retry is scheduled");
            assert!(scheduled > now);
            assert!(queue.dequeue_next_at(now).is_none());
            now = scheduled;
        }

        let task = queue.dequeue_next_at(now).expect("eligible");
        let failed = queue.fail_at(task.id, "timeout", now).expect("fail");
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        assert!(queue.dequeue_next_at(now + secs(86_400)).is_none());
        let stats = queue.stats_at(now);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_total, 1);
        assert_eq!(queue.get(id).map(|t| t.status), Some(TaskStatus::Failed));
    }

    #[test]
    fn test_zero_max_attempts_allows_one_attempt() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        let id = queue
            .enqueue_at(
                "publish",
                json!(null),
                EnqueueOptions::new().with_max_attempts(0),
                now,
            )
            .expect("enqueue");
        assert_eq!(queue.get(id).map(|t| t.max_attempts), Some(1));

        let task = queue.dequeue_next_at(now).expect("eligible");
        let failed = queue.fail_at(task.id, "boom", now).expect("fail");
        assert_eq!(failed.attempts, 1);
        assert!(failed.attempts <= failed.max_attempts);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(queue.snapshot().validate().is_ok());
    }

    #[test]
    fn test_retry_delay_uses_attempts_after_increment() {
        let queue = TaskQueue::new(QueueConfig {
            retry_base: Duration::from_millis(1000),
            ..QueueConfig::default()
        });
        let now = Utc::now();
        queue
            .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
            .expect("enqueue");
        let task = queue.dequeue_next_at(now).expect("eligible");
        let failed = queue.fail_at(task.id, "x", now).expect("fail");

        assert_eq!(failed.scheduled_for, Some(now + chrono::Duration::milliseconds(2000)));
    }

    #[test]
    fn test_complete_and_fail_require_in_flight() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        let id = queue
            .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
            .expect("enqueue");

        let err = queue.complete_at(id, now).unwrap_err();
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("pending"));

        let unknown = Uuid::new_v4();
        let err = queue.fail_at(unknown, "x", now).unwrap_err();
        assert!(err.to_string().contains("unknown"));

        let task = queue.dequeue_next_at(now).expect("eligible");
        queue.complete_at(task.id, now).expect("complete");
        let err = queue.complete_at(task.id, now).unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_stats_counts() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        for priority in [TaskPriority::Low, TaskPriority::High, TaskPriority::Critical] {
            queue
                .enqueue_at("t", json!(null), opts(priority), now)
                .expect("enqueue");
        }

        let stats = queue.stats_at(now + secs(5));
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.high_priority, 2);
        assert_eq!(stats.oldest_pending_age_ms, Some(5000));
        assert_eq!(stats.capacity, 1000);
        assert!(stats.utilization() > 0.0);
    }

    #[test]
    fn test_restore_reclaims_in_flight_tasks() {
        let source = TaskQueue::default();
        let now = Utc::now();
        source
            .enqueue_at("t", json!(1), EnqueueOptions::new(), now)
            .expect("enqueue");
        let second = source
            .enqueue_at("t", json!(2), EnqueueOptions::new(), now)
            .expect("enqueue");
        let in_flight = source.dequeue_next_at(now).expect("eligible");

        let snapshot = source.snapshot();
        assert!(snapshot.validate().is_ok());

        let restored = TaskQueue::default();
        assert_eq!(restored.restore(snapshot, now), 2);

        let reclaimed = restored.get(in_flight.id).expect("reclaimed task exists");
        assert_eq!(reclaimed.status, TaskStatus::Retrying);
        assert_eq!(reclaimed.attempts, 0);
        assert!(restored.get(second).is_some());
        assert_eq!(restored.stats_at(now).processing, 0);
    }

    #[test]
    fn test_replace_state_keeps_live_in_flight() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        queue
            .enqueue_at("t", json!(1), EnqueueOptions::new(), now)
            .expect("enqueue");
        let snapshot = queue.snapshot();

        let working = queue.dequeue_next_at(now).expect("eligible");
        let extra = queue
            .enqueue_at("t", json!(2), EnqueueOptions::new(), now)
            .expect("enqueue");

        let depth = queue.replace_state(snapshot, now);
        assert_eq!(depth, 0);
        assert!(queue.get(extra).is_none());
        assert_eq!(
            queue.get(working.id).map(|t| t.status),
            Some(TaskStatus::Processing)
        );
        assert!(queue.complete_at(working.id, now).is_ok());
    }

    #[test]
    fn test_snapshot_validation_rejects_bad_state() {
        let now = Utc::now();
        let task = Task::new("t", json!(null), TaskPriority::Low, 3, now);

        let duplicate = QueueSnapshot::new(now, vec![task.clone(), task.clone()], vec![]);
        assert!(duplicate.validate().unwrap_err().contains("duplicate"));

        let mut over = task.clone();
        over.attempts = 5;
        let over = QueueSnapshot::new(now, vec![over], vec![]);
        assert!(over.validate().unwrap_err().contains("attempts"));

        let misplaced = QueueSnapshot::new(now, vec![], vec![task]);
        assert!(misplaced.validate().unwrap_err().contains("in-flight"));
    }

    #[test]
    fn test_prune_and_trim_terminal() {
        let queue = TaskQueue::default();
        let now = Utc::now();
        for _ in 0..3 {
            queue
                .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
                .expect("enqueue");
            let task = queue.dequeue_next_at(now).expect("eligible");
            queue.complete_at(task.id, now).expect("complete");
        }

        assert_eq!(queue.prune_terminal_at(now + secs(60)), 0);
        assert_eq!(queue.prune_terminal_at(now + secs(25 * 3600)), 3);
        assert!(queue.terminal_tasks().is_empty());
        assert_eq!(queue.stats_at(now).completed_total, 3);

        queue
            .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
            .expect("enqueue");
        let task = queue.dequeue_next_at(now).expect("eligible");
        queue.complete_at(task.id, now).expect("complete");
        assert_eq!(queue.trim(), 1);
    }

    #[test]
    fn test_terminal_record_cap() {
        let queue = TaskQueue::new(QueueConfig {
            max_terminal_records: 2,
            ..QueueConfig::default()
        });
        let now = Utc::now();
        for _ in 0..4 {
            queue
                .enqueue_at("t", json!(null), EnqueueOptions::new(), now)
                .expect("enqueue");
            let task = queue.dequeue_next_at(now).expect("eligible");
            queue.complete_at(task.id, now).expect("complete");
        }
        assert_eq!(queue.terminal_tasks().len(), 2);
    }

    #[test]
    fn test_concurrent_dequeue_never_duplicates() {
        let queue = std::sync::Arc::new(TaskQueue::default());
        for i in 0..200 {
            queue
                .enqueue("t", json!(i), EnqueueOptions::new())
                .expect("enqueue");
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = std::sync::Arc::clone(&queue);
                std::thread::spawn(move || {
                    std::iter::from_fn(|| queue.dequeue_next())
                        .map(|t| t.id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<Uuid> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker thread panicked"))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_reset() {
        let queue = TaskQueue::default();
        queue
            .enqueue("t", json!(null), EnqueueOptions::new())
            .expect("enqueue");
        queue.reset();
        assert_eq!(queue.stats(), QueueStats {
            capacity: 1000,
            ..QueueStats::default()
        });
    }
}
