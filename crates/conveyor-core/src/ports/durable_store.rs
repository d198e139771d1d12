//! DurableStore port - 正本（リレーショナル DB）
//!
//! Drainer だけが書き込みます。レコードは task_id で一意、チェックポイントはストリームごと。

use async_trait::async_trait;

use crate::domain::{
    ConveyorError, DrainCheckpoint, DurableRecord, ErrorKind, Offset, StreamName, TaskId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    /// チェックポイントは単調非減少
    #[error("checkpoint for {stream} would regress from {committed} to {attempted}")]
    CheckpointRegression {
        stream: StreamName,
        committed: Offset,
        attempted: Offset,
    },

    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::Transient,
            StoreError::CheckpointRegression { .. } => ErrorKind::Superseded,
            StoreError::Decode(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<StoreError> for ConveyorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ConveyorError::StoreUnavailable(msg),
            StoreError::CheckpointRegression {
                stream,
                committed,
                attempted,
            } => ConveyorError::CheckpointRegression {
                stream,
                committed,
                attempted,
            },
            err @ StoreError::Decode(_) => ConveyorError::StoreUnavailable(err.to_string()),
        }
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// バッチ全体を 1 ステートメントで upsert する（task_id で冪等）。
    ///
    /// 既存行は `DurableRecord::supersedes` を満たすレコードでのみ上書きされる。
    async fn upsert_records(&self, records: &[DurableRecord]) -> Result<(), StoreError>;

    async fn checkpoint(&self, stream: &StreamName) -> Result<Option<DrainCheckpoint>, StoreError>;

    /// チェックポイントを進める。既存より小さい offset は `CheckpointRegression`。
    async fn commit_checkpoint(&self, checkpoint: &DrainCheckpoint) -> Result<(), StoreError>;

    async fn record(&self, task_id: TaskId) -> Result<Option<DurableRecord>, StoreError>;
}
