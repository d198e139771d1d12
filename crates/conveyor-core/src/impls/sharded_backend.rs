//! Queue backend spread over several shard backends.
//!
//! Each stream lives on exactly one shard, picked by `shard_index`. Per-stream
//! ordering is therefore the shard's ordering; nothing is ordered across streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::domain::{
    AckEntry, AckRecord, ClaimLease, Claimed, ConsumerId, DeadLetter, Offset, StreamLease,
    StreamName, Task, TaskId, TaskStatus,
};
use crate::observability::QueueCounts;
use crate::ports::{ClaimRequest, QueueBackend, QueueError};
use crate::queue::shard_index;

pub struct ShardedQueueBackend {
    shards: Vec<Arc<dyn QueueBackend>>,
    /// Sleep between passes when a claim spans several shards.
    poll_interval: Duration,
}

impl ShardedQueueBackend {
    /// Returns `None` for an empty shard list.
    pub fn new(shards: Vec<Arc<dyn QueueBackend>>) -> Option<Self> {
        if shards.is_empty() {
            return None;
        }
        Some(Self {
            shards,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_of(&self, stream: &StreamName) -> &Arc<dyn QueueBackend> {
        &self.shards[shard_index(stream, self.shards.len())]
    }

    /// Claim with every stream on the same shard: delegate as is.
    fn single_shard(&self, request: &ClaimRequest) -> Option<&Arc<dyn QueueBackend>> {
        let mut indexes = request
            .streams
            .iter()
            .map(|s| shard_index(s, self.shards.len()));
        let first = indexes.next()?;
        indexes
            .all(|i| i == first)
            .then(|| &self.shards[first])
    }
}

#[async_trait]
impl QueueBackend for ShardedQueueBackend {
    async fn append(
        &self,
        stream: &StreamName,
        group: &str,
        task: Task,
    ) -> Result<Offset, QueueError> {
        self.shard_of(stream).append(stream, group, task).await
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Claimed>, QueueError> {
        if request.streams.is_empty() {
            tokio::time::sleep(request.wait).await;
            return Ok(None);
        }
        if let Some(shard) = self.single_shard(request) {
            return shard.claim(request).await;
        }

        let deadline = Instant::now() + request.wait;
        loop {
            for stream in &request.streams {
                let probe = ClaimRequest {
                    streams: vec![stream.clone()],
                    wait: Duration::ZERO,
                    ..request.clone()
                };
                if let Some(claimed) = self.shard_of(stream).claim(&probe).await? {
                    return Ok(Some(claimed));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }

    async fn renew(
        &self,
        lease: &ClaimLease,
        lease_for: Duration,
    ) -> Result<ClaimLease, QueueError> {
        self.shard_of(&lease.stream).renew(lease, lease_for).await
    }

    async fn ack(&self, lease: &ClaimLease, record: AckRecord) -> Result<Offset, QueueError> {
        self.shard_of(&lease.stream).ack(lease, record).await
    }

    async fn nack(&self, lease: &ClaimLease, retry: Task) -> Result<Offset, QueueError> {
        self.shard_of(&lease.stream).nack(lease, retry).await
    }

    async fn dead_letter(
        &self,
        lease: &ClaimLease,
        task: Task,
        reason: String,
        record: AckRecord,
    ) -> Result<Offset, QueueError> {
        self.shard_of(&lease.stream)
            .dead_letter(lease, task, reason, record)
            .await
    }

    async fn read_acks(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<AckEntry>, QueueError> {
        self.shard_of(stream).read_acks(stream, after, max, wait).await
    }

    async fn trim_acks(&self, stream: &StreamName, up_to: Offset) -> Result<usize, QueueError> {
        self.shard_of(stream).trim_acks(stream, up_to).await
    }

    async fn ack_backlog(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
    ) -> Result<usize, QueueError> {
        self.shard_of(stream).ack_backlog(stream, after).await
    }

    async fn acquire_stream_lease(
        &self,
        stream: &StreamName,
        holder: &ConsumerId,
        ttl: Duration,
    ) -> Result<Option<StreamLease>, QueueError> {
        self.shard_of(stream)
            .acquire_stream_lease(stream, holder, ttl)
            .await
    }

    async fn release_stream_lease(&self, lease: &StreamLease) -> Result<(), QueueError> {
        self.shard_of(&lease.stream).release_stream_lease(lease).await
    }

    async fn dead_letters(&self, stream: &StreamName) -> Result<Vec<DeadLetter>, QueueError> {
        self.shard_of(stream).dead_letters(stream).await
    }

    /// The task id alone does not name a stream, so every shard is asked in turn.
    async fn requeue_dead_letter(
        &self,
        task_id: TaskId,
    ) -> Result<(StreamName, Offset), QueueError> {
        for shard in &self.shards {
            match shard.requeue_dead_letter(task_id).await {
                Err(QueueError::DeadLetterNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(QueueError::DeadLetterNotFound(task_id))
    }

    async fn purge_dead_letters(
        &self,
        stream: &StreamName,
        before: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        self.shard_of(stream).purge_dead_letters(stream, before).await
    }

    async fn counts(&self, stream: &StreamName) -> Result<QueueCounts, QueueError> {
        self.shard_of(stream).counts(stream).await
    }

    async fn entry_status(
        &self,
        stream: &StreamName,
        task_id: TaskId,
    ) -> Result<Option<TaskStatus>, QueueError> {
        self.shard_of(stream).entry_status(stream, task_id).await
    }

    fn max_entry_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.max_entry_bytes())
            .min()
            .unwrap_or(0)
    }
}
