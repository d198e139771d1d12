use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Discriminator used to pick a handler (e.g. `retry_payment`, `webhook`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task status.
///
/// State transitions:
/// - Pending -> Claimed -> Succeeded
/// - Pending -> Claimed -> Pending (lease expired, reclaim)
/// - Pending -> Claimed -> Failed (entry retired; a fresh Pending entry carries the retry)
/// - Pending -> Claimed -> DeadLettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Succeeded,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    /// Transitions are monotonic except Claimed -> Pending.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Pending)
                | (Claimed, Succeeded)
                | (Claimed, Failed)
                | (Claimed, DeadLettered)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as the producer describes it.
///
/// Tasks travel by value; a retry or a replay is a new `Task` value appended
/// as a new queue entry, never an in-place edit of the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    task_id: TaskId,
    kind: TaskKind,
    payload: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    attempt_count: u32,
    status: TaskStatus,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        kind: TaskKind,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            kind,
            payload,
            scheduled_at,
            attempt_count: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// Number of failed attempts so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Size of the payload once encoded for the backend.
    pub fn payload_size(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(&self.payload).map(|bytes| bytes.len())
    }

    /// Pending copy for the next attempt, eligible from `retry_at`.
    pub fn for_retry(&self, attempt_count: u32, retry_at: DateTime<Utc>) -> Task {
        Task {
            scheduled_at: retry_at,
            attempt_count,
            status: TaskStatus::Pending,
            ..self.clone()
        }
    }

    /// Parked copy once the retry budget is spent (or the payload is poison).
    pub fn dead_lettered(&self, attempt_count: u32) -> Task {
        Task {
            attempt_count,
            status: TaskStatus::DeadLettered,
            ..self.clone()
        }
    }

    /// Fresh Pending copy for a manual replay; the attempt counter starts over.
    pub fn replayed(&self, now: DateTime<Utc>) -> Task {
        Task {
            scheduled_at: now,
            attempt_count: 0,
            status: TaskStatus::Pending,
            ..self.clone()
        }
    }
}
