//! Errors - エラー型と分類
//!
//! ErrorKind は運用上の分類。リトライするかどうかは kind で決める。

use super::{Offset, StreamName, TaskId};

/// ConveyorError の運用分類
///
/// - Transient: 一時的なエラー（ローカルでリトライ）
/// - Domain: ハンドラ起因のエラー（Decider が判断する）
/// - Infrastructure: バックエンド/ストアの障害（リトライ予算切れ後）
/// - Invalid: 入力や設定の誤り（リトライ無意味）
/// - Superseded: 所有権（claim / ストリームリース）を他者に奪われた。破棄して手放す
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Domain,
    Infrastructure,
    Invalid,
    Superseded,
}

impl ErrorKind {
    /// ローカルのバックオフ再試行に回すか
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Transient
    }
}

/// ConveyorError はパイプライン全体のエラー
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// リースが失効し、他のコンシューマに奪われた可能性がある
    #[error("claim expired for {stream}@{offset}")]
    ClaimExpired { stream: StreamName, offset: Offset },

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("poison payload: {0}")]
    PoisonPayload(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(TaskId),

    #[error("stream lease lost: {0}")]
    StreamLeaseLost(StreamName),

    /// 他の drainer が先にチェックポイントを進めていた
    #[error("checkpoint for {stream} is already at {committed}, cannot move to {attempted}")]
    CheckpointRegression {
        stream: StreamName,
        committed: Offset,
        attempted: Offset,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConveyorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConveyorError::QueueUnavailable(_) => ErrorKind::Transient,
            ConveyorError::ClaimExpired { .. } => ErrorKind::Superseded,
            ConveyorError::StreamLeaseLost(_) => ErrorKind::Superseded,
            ConveyorError::CheckpointRegression { .. } => ErrorKind::Superseded,
            ConveyorError::HandlerFailure(_) => ErrorKind::Domain,
            ConveyorError::PoisonPayload(_) => ErrorKind::Domain,
            ConveyorError::StoreUnavailable(_) => ErrorKind::Infrastructure,
            ConveyorError::PayloadTooLarge { .. } => ErrorKind::Invalid,
            ConveyorError::DeadLetterNotFound(_) => ErrorKind::Invalid,
            ConveyorError::Config(_) => ErrorKind::Invalid,
        }
    }
}
