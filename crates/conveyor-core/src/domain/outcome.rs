//! Outcome model: what a handler reports, and what the system of record keeps.
//!
//! Outcomes are keyed by the stable `task_id`; the durable projection is a
//! tagged terminal status, never a mutable in-place state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AckEntry, Offset, StreamName, TaskId, TaskKind};

/// Classification of one handler attempt.
///
/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / FAILURE / POISON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    /// Recoverable failure, counted against the retry budget.
    Failure,
    /// The payload cannot even be attempted; retrying would only repeat it.
    Poison,
}

/// Result of one attempt, as returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            result: None,
            reason: None,
        }
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::success()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            result: None,
            reason: Some(reason.into()),
        }
    }

    pub fn poison(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Poison,
            result: None,
            reason: Some(reason.into()),
        }
    }
}

/// Terminal status persisted in the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Succeeded,
    DeadLettered,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Succeeded => "succeeded",
            FinalStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown final status {0:?}")]
pub struct UnknownFinalStatus(pub String);

impl FromStr for FinalStatus {
    type Err = UnknownFinalStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(FinalStatus::Succeeded),
            "dead_lettered" => Ok(FinalStatus::DeadLettered),
            other => Err(UnknownFinalStatus(other.to_string())),
        }
    }
}

/// Relational projection of a task's terminal outcome. Unique on `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub stream: StreamName,
    pub final_status: FinalStatus,
    pub result_payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempt_count: u32,
    pub completed_at: DateTime<Utc>,
    /// Ack-stream offset this row was drained from.
    pub ack_offset: Offset,
}

impl DurableRecord {
    pub fn from_ack(ack: &AckEntry) -> Self {
        let record = &ack.record;
        Self {
            task_id: record.task_id,
            kind: record.kind.clone(),
            stream: record.stream.clone(),
            final_status: record.final_status,
            result_payload: record.result_payload.clone(),
            error: record.error.clone(),
            attempt_count: record.attempt_count,
            completed_at: record.completed_at,
            ack_offset: ack.offset,
        }
    }

    /// Whether this row may overwrite `existing` on upsert.
    ///
    /// Within one stream a row only moves forward in ack order, so replaying an
    /// older batch leaves newer rows untouched and replaying the same batch
    /// writes identical values.
    pub fn supersedes(&self, existing: &DurableRecord) -> bool {
        self.stream != existing.stream || self.ack_offset >= existing.ack_offset
    }
}

/// Last ack offset of a stream that is safely in the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainCheckpoint {
    pub stream: StreamName,
    pub offset: Offset,
    pub committed_at: DateTime<Utc>,
}
