//! DeadLetters - 隔離されたタスクの運用窓口
//!
//! 自動 replay はしない。replay は attempt_count = 0 の新しい Pending エントリを作る。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{ConveyorError, DeadLetter, Offset, StreamName, TaskId};
use crate::ports::clock::span;
use crate::ports::{Clock, QueueBackend};

pub struct DeadLetters {
    backend: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
}

impl DeadLetters {
    pub fn new(backend: Arc<dyn QueueBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub async fn list(&self, stream: &StreamName) -> Result<Vec<DeadLetter>, ConveyorError> {
        Ok(self.backend.dead_letters(stream).await?)
    }

    /// 元のストリームに積み直す
    pub async fn replay(&self, task_id: TaskId) -> Result<(StreamName, Offset), ConveyorError> {
        let (stream, offset) = self.backend.requeue_dead_letter(task_id).await?;
        info!(%task_id, %stream, %offset, "dead letter replayed");
        Ok((stream, offset))
    }

    pub async fn purge_before(
        &self,
        stream: &StreamName,
        before: DateTime<Utc>,
    ) -> Result<usize, ConveyorError> {
        let purged = self.backend.purge_dead_letters(stream, before).await?;
        if purged > 0 {
            info!(%stream, purged, %before, "dead letters purged");
        }
        Ok(purged)
    }

    /// `age` より古いものを消す
    pub async fn purge_older_than(
        &self,
        stream: &StreamName,
        age: Duration,
    ) -> Result<usize, ConveyorError> {
        let before = self.clock.now() - span(age);
        self.purge_before(stream, before).await
    }
}
