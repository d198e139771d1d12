//! QueueBackend port - ストリーム型キューの抽象化
//!
//! バックエンドはストリームごとに順序付きのエントリを保持し、
//! consumer group 単位で claim（リース付き）を発行します。
//! ack はストリームごとの ack ログに追記され、Drainer がそれを tail します。
//!
//! # 不変条件
//! - エントリは追記のみ。リトライは新しい offset での再追記
//! - 1 エントリにつき有効なリースは高々 1 つ
//! - リースは `now >= expires_at` で失効し、失効後のトークンは拒否される
//! - ストリームごとに有効な StreamLease の保持者は高々 1 つ

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AckEntry, AckRecord, ClaimLease, Claimed, ConsumerId, ConveyorError, DeadLetter, ErrorKind,
    LeaseToken, Offset, StreamLease, StreamName, Task, TaskId, TaskStatus,
};
use crate::observability::QueueCounts;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// バックエンドに到達できない（一時的）
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    /// リースが失効済み、または別のトークンに置き換えられた
    #[error("lease {token} on {stream}@{offset} is no longer held")]
    LeaseLost {
        token: LeaseToken,
        stream: StreamName,
        offset: Offset,
    },

    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },

    #[error("no dead letter for {0}")]
    DeadLetterNotFound(TaskId),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Unavailable(_) => ErrorKind::Transient,
            QueueError::LeaseLost { .. } => ErrorKind::Superseded,
            QueueError::EntryTooLarge { .. } | QueueError::DeadLetterNotFound(_) => {
                ErrorKind::Invalid
            }
            QueueError::Encoding(_) => ErrorKind::Domain,
        }
    }
}

impl From<QueueError> for ConveyorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unavailable(msg) => ConveyorError::QueueUnavailable(msg),
            QueueError::LeaseLost { stream, offset, .. } => {
                ConveyorError::ClaimExpired { stream, offset }
            }
            QueueError::EntryTooLarge { size, max } => ConveyorError::PayloadTooLarge { size, max },
            QueueError::DeadLetterNotFound(task_id) => ConveyorError::DeadLetterNotFound(task_id),
            QueueError::Encoding(e) => ConveyorError::PoisonPayload(e.to_string()),
        }
    }
}

/// claim の引数
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub group: String,
    pub consumer: ConsumerId,
    /// この順に探す（consumer 側で毎回ローテーションする）
    pub streams: Vec<StreamName>,
    pub lease_for: Duration,
    /// 何もなければ最大この時間だけ待つ
    pub wait: Duration,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Pending エントリを追記する。
    ///
    /// 同じ task_id の未決着エントリが既にあれば、新たに追記せずその offset を返す。
    async fn append(
        &self,
        stream: &StreamName,
        group: &str,
        task: Task,
    ) -> Result<Offset, QueueError>;

    /// claim 可能なエントリを 1 つ取得してリースを発行する。
    ///
    /// 対象は group が一致し、`scheduled_at <= now` で、リースが無いか失効しているもの。
    /// ストリーム内では offset の古い順。`wait` の間に何も無ければ `None`。
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Claimed>, QueueError>;

    /// リースを延長する（heartbeat）。失効していれば `LeaseLost`。
    async fn renew(&self, lease: &ClaimLease, lease_for: Duration)
    -> Result<ClaimLease, QueueError>;

    /// 成功を記録する。エントリを Succeeded にし、ack ログに追記してリースを解放する。
    async fn ack(&self, lease: &ClaimLease, record: AckRecord) -> Result<Offset, QueueError>;

    /// エントリを Failed として退役させ、`retry` を新しい Pending エントリとして追記する。
    async fn nack(&self, lease: &ClaimLease, retry: Task) -> Result<Offset, QueueError>;

    /// エントリを DeadLettered にし、dead letter に保管して終端 ack を追記する。
    async fn dead_letter(
        &self,
        lease: &ClaimLease,
        task: Task,
        reason: String,
        record: AckRecord,
    ) -> Result<Offset, QueueError>;

    /// `after` より後の ack を最大 `max` 件読む。無ければ `wait` まで待つ。
    async fn read_acks(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<AckEntry>, QueueError>;

    /// `up_to` 以下の ack を削除する。削除件数を返す。
    async fn trim_acks(&self, stream: &StreamName, up_to: Offset) -> Result<usize, QueueError>;

    /// `after` より後に残っている ack の件数。
    async fn ack_backlog(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
    ) -> Result<usize, QueueError>;

    /// ストリームの drain 権を取得する。
    ///
    /// 他の保持者のリースが有効なら `None`。同じ holder なら延長し、トークンは変わらない。
    async fn acquire_stream_lease(
        &self,
        stream: &StreamName,
        holder: &ConsumerId,
        ttl: Duration,
    ) -> Result<Option<StreamLease>, QueueError>;

    async fn release_stream_lease(&self, lease: &StreamLease) -> Result<(), QueueError>;

    async fn dead_letters(&self, stream: &StreamName) -> Result<Vec<DeadLetter>, QueueError>;

    /// dead letter を取り出し、attempt_count = 0 の Pending エントリとして再追記する。
    async fn requeue_dead_letter(
        &self,
        task_id: TaskId,
    ) -> Result<(StreamName, Offset), QueueError>;

    /// `before` より前に保管された dead letter を削除する。
    async fn purge_dead_letters(
        &self,
        stream: &StreamName,
        before: DateTime<Utc>,
    ) -> Result<usize, QueueError>;

    async fn counts(&self, stream: &StreamName) -> Result<QueueCounts, QueueError>;

    /// task_id の最新エントリの状態。
    async fn entry_status(
        &self,
        stream: &StreamName,
        task_id: TaskId,
    ) -> Result<Option<TaskStatus>, QueueError>;

    /// 1 エントリの payload の上限（バイト）。
    fn max_entry_bytes(&self) -> usize;
}
