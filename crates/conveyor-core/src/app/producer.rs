//! Producer - タスクをキューに積む
//!
//! タスクロジックは実行しない。task_id は Producer が採番し、内部リトライでも
//! 同じ id を使う（バックエンドが未決着の同一 id を重複排除する）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::domain::{ConveyorError, Offset, StreamName, Task, TaskId, TaskKind};
use crate::ports::{Clock, IdGenerator, QueueBackend, UlidGenerator};
use crate::queue::RetryPolicy;
use crate::typed;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// `enqueue` の書き込み先
    pub stream: StreamName,
    pub consumer_group: String,
    /// バックエンド到達不能時のリトライ
    pub retry_policy: RetryPolicy,
    /// append の試行回数上限（初回を含む）
    pub max_attempts: u32,
}

pub struct Producer {
    backend: Arc<dyn QueueBackend>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(backend: Arc<dyn QueueBackend>, clock: Arc<dyn Clock>, config: ProducerConfig) -> Self {
        Self {
            backend,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            config,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// 既定のストリームに積む。`scheduled_at` が無ければ今すぐ実行可能。
    pub async fn enqueue(
        &self,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, ConveyorError> {
        let stream = self.config.stream.clone();
        self.enqueue_to(&stream, kind, payload, scheduled_at).await
    }

    pub async fn enqueue_to(
        &self,
        stream: &StreamName,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, ConveyorError> {
        let task_id = self.ids.generate_task_id();
        self.enqueue_with_id(stream, task_id, kind, payload, scheduled_at)
            .await?;
        Ok(task_id)
    }

    /// 呼び出し側が採番した id で積む。
    ///
    /// 同じ id の未決着エントリがあれば新たに積まずにその offset を返す。
    pub async fn enqueue_with_id(
        &self,
        stream: &StreamName,
        task_id: TaskId,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Offset, ConveyorError> {
        let scheduled_at = scheduled_at.unwrap_or_else(|| self.clock.now());
        let task = Task::new(task_id, kind.into(), payload, scheduled_at);

        let size = task
            .payload_size()
            .map_err(|e| ConveyorError::PoisonPayload(e.to_string()))?;
        let max = self.backend.max_entry_bytes();
        if size > max {
            return Err(ConveyorError::PayloadTooLarge { size, max });
        }

        let offset = self.append_with_retry(stream, task).await?;
        debug!(%task_id, %stream, %offset, "task enqueued");
        Ok(offset)
    }

    /// 型付きタスクを積む。kind は `T::KIND`。
    pub async fn enqueue_task<T: typed::Task>(
        &self,
        task: &T,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, ConveyorError> {
        let payload =
            serde_json::to_value(task).map_err(|e| ConveyorError::PoisonPayload(e.to_string()))?;
        self.enqueue(T::KIND, payload, scheduled_at).await
    }

    async fn append_with_retry(
        &self,
        stream: &StreamName,
        task: Task,
    ) -> Result<Offset, ConveyorError> {
        let task_id = task.task_id();
        let mut backoff = self.config.retry_policy.backoff(self.config.max_attempts);
        loop {
            match self
                .backend
                .append(stream, &self.config.consumer_group, task.clone())
                .await
            {
                Ok(offset) => return Ok(offset),
                Err(err) if err.kind().is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(%task_id, %stream, attempt = backoff.failures(), ?delay, error = %err, "append failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(%task_id, %stream, attempts = backoff.failures(), error = %err, "append retry budget exhausted");
                        return Err(ConveyorError::QueueUnavailable(err.to_string()));
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}
