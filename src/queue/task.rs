//! Task definitions for the queue.
//!
//! This module defines the core types of the task lifecycle:
//!
//! - `Task`: A unit of work owned by the queue
//! - `TaskPriority`: Ordered priority tiers
//! - `TaskStatus`: Lifecycle state of a task
//! - `EnqueueOptions`: Per-task overrides accepted by `enqueue`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::utils::duration_since;

/// Priority tier of a task. Variants are declared in ascending order so the
/// derived `Ord` gives `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the pending set.
    Pending,
    /// Handed to a worker, held in the in-flight set.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts.
    Failed,
    /// Failed at least once, waiting in the pending set for its backoff to elapse.
    Retrying,
}

impl TaskStatus {
    /// Returns whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns whether a task in this state belongs to the pending set.
    pub fn is_queued(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// A unit of work.
///
/// Tasks are created by [`super::TaskQueue::enqueue`] and mutated only through
/// the queue's transition operations. The payload is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// Type tag used to route the task to a handler.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque payload supplied by the producer.
    pub payload: serde_json::Value,
    /// Priority tier.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// Attempts allowed before the task becomes `Failed`.
    pub max_attempts: u32,
    /// When this task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When this task last changed state.
    pub updated_at: DateTime<Utc>,
    /// Earliest time the task may be dequeued.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Creates a new pending task.
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            last_error: None,
        }
    }

    /// Sets the not-before time.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// The time from which the task is eligible for dequeue.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.scheduled_for.unwrap_or(self.created_at)
    }

    /// Returns whether the task may be dequeued at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_queued() && self.eligible_at() <= now
    }

    /// Returns whether the task should be retried after one more failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the task was created.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        duration_since(now, self.created_at)
    }
}

/// Per-task overrides accepted by `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority tier; the queue default applies when unset.
    pub priority: Option<TaskPriority>,
    /// Attempt cap; the queue default applies when unset.
    pub max_attempts: Option<u32>,
    /// Earliest dequeue time.
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the attempt cap. The queue raises a cap of 0 to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the not-before time.
    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<TaskPriority>(), Ok(TaskPriority::High));
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", TaskStatus::Pending), "pending");
        assert_eq!(format!("{}", TaskStatus::Processing), "processing");
        assert_eq!(format!("{}", TaskStatus::Completed), "completed");
        assert_eq!(format!("{}", TaskStatus::Failed), "failed");
        assert_eq!(format!("{}", TaskStatus::Retrying), "retrying");
    }

    #[test]
    fn test_status_classes() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(TaskStatus::Retrying.is_queued());
        assert!(!TaskStatus::Processing.is_queued());
    }

    #[test]
    fn test_task_new() {
        let now = Utc::now();
        let task = Task::new(
            "transform",
            serde_json::json!({"url": "https://example.com"}),
            TaskPriority::High,
            3,
            now,
        );

        assert!(!task.id.is_nil());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.remaining_attempts(), 3);
        assert!(task.should_retry());
        assert!(task.is_eligible(now));
        assert_eq!(task.eligible_at(), now);
    }

    #[test]
    fn test_task_not_before() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        let task =
            Task::new("publish", serde_json::Value::Null, TaskPriority::Low, 1, now)
                .with_scheduled_for(later);

        assert!(!task.is_eligible(now));
        assert!(task.is_eligible(later));
    }

    #[test]
    fn test_task_serializes_type_tag() {
        let task = Task::new(
            "scrape",
            serde_json::Value::Null,
            TaskPriority::Medium,
            3,
            Utc::now(),
        );
        let json = serde_json::to_value(&task).expect("serialization should work");

        assert_eq!(json["type"], "scrape");
        assert_eq!(json["priority"], "medium");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_enqueue_options_builder() {
        let at = Utc::now();
        let opts = EnqueueOptions::new()
            .with_priority(TaskPriority::Critical)
            .with_max_attempts(5)
            .with_not_before(at);

        assert_eq!(opts.priority, Some(TaskPriority::Critical));
        assert_eq!(opts.max_attempts, Some(5));
        assert_eq!(opts.not_before, Some(at));
    }
}
