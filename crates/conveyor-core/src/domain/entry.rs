//! Records owned by the queue backend: entries, acks and dead letters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::FinalStatus;
use super::{Offset, StreamName, Task, TaskId, TaskKind};

/// A task as stored in a stream.
///
/// Entries are immutable once appended; a retry is a new entry at a new offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub stream: StreamName,
    pub offset: Offset,
    pub consumer_group: String,
    pub enqueued_at: DateTime<Utc>,
    pub task: Task,
}

/// Terminal result of a task, appended to the ack stream for the drainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub stream: StreamName,
    /// Offset of the entry that produced this ack.
    pub source_offset: Offset,
    pub final_status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_count: u32,
    pub completed_at: DateTime<Utc>,
}

impl AckRecord {
    pub fn succeeded(
        entry: &QueueEntry,
        result_payload: Option<serde_json::Value>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: entry.task.task_id(),
            kind: entry.task.kind().clone(),
            stream: entry.stream.clone(),
            source_offset: entry.offset,
            final_status: FinalStatus::Succeeded,
            result_payload,
            error: None,
            attempt_count: entry.task.attempt_count(),
            completed_at,
        }
    }

    pub fn dead_lettered(
        entry: &QueueEntry,
        attempt_count: u32,
        error: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: entry.task.task_id(),
            kind: entry.task.kind().clone(),
            stream: entry.stream.clone(),
            source_offset: entry.offset,
            final_status: FinalStatus::DeadLettered,
            result_payload: None,
            error: Some(error.into()),
            attempt_count,
            completed_at,
        }
    }
}

/// An ack record with its position in the stream's ack log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEntry {
    pub offset: Offset,
    pub record: AckRecord,
}

/// A task parked after exhausting its retries, kept until an operator acts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub stream: StreamName,
    pub consumer_group: String,
    pub task: Task,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}
