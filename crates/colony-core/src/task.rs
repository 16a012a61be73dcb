use crate::{Metadata, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    /// Completed, failed, and dead-lettered tasks never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLettered
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// Caller-supplied options for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Overrides the queue's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the queue's default in-progress timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A unit of work flowing through the queue and onto agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Symbolic name or type of work.
    pub name: String,
    /// Opaque payload handed to the executing agent.
    pub content: serde_json::Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Agent currently (or last) running this task.
    pub assigned_agent: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Most recent failure reason.
    pub error: Option<String>,
}

impl Task {
    /// Create a queued task from a name, payload, and options.
    ///
    /// `default_max_retries` and `default_timeout_ms` apply when the options
    /// leave them unset.
    pub fn new(
        name: impl Into<String>,
        content: serde_json::Value,
        options: TaskOptions,
        default_max_retries: u32,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content,
            priority: options.priority,
            correlation_id: options.correlation_id,
            metadata: options.metadata,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            timeout_ms: options.timeout_ms.unwrap_or(default_timeout_ms),
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_agent: None,
            result: None,
            error: None,
        }
    }

    /// Whether the in-progress deadline for this task has passed at `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (TaskStatus::InProgress, Some(started)) => {
                let elapsed = now.signed_duration_since(started).num_milliseconds();
                elapsed >= 0 && elapsed as u64 >= self.timeout_ms
            }
            _ => false,
        }
    }

    /// Milliseconds from enqueue to completion, if completed.
    pub fn latency_ms(&self) -> Option<u64> {
        let done = self.completed_at?;
        let ms = done.signed_duration_since(self.enqueued_at).num_milliseconds();
        Some(ms.max(0) as u64)
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
