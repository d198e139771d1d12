//! Drainer - ack ストリーム → 正本ストア
//!
//! 1 サイクル:
//! 0. ストリームリースを延長する（空サイクルでも。トークンが変わっていたら失っている）
//! 1. チェックポイントを読む（無ければ先頭から）
//! 2. checkpoint 以降の ack を batch_size 件 or flush_interval まで集める
//! 3. 1 ステートメントで upsert（失敗はバックオフで再試行、チェックポイントは据え置き）
//! 4. ストリームリースを延長し、保持していればチェックポイントを進める
//! 5. チェックポイントまでの ack を trim
//!
//! ストリームごとにリースを持つ 1 台だけが書き込む。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Liveness;
use crate::domain::{
    AckEntry, ConsumerId, ConveyorError, DrainCheckpoint, DurableRecord, ErrorKind, Offset,
    StreamLease, StreamName,
};
use crate::ports::{Clock, DurableStore, QueueBackend, QueueError, StoreError};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
pub struct DrainerConfig {
    /// ストリームリースの保持者名
    pub holder: ConsumerId,
    pub streams: Vec<StreamName>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// flush_interval より長いこと（毎サイクル延長するため）
    pub lease_ttl: Duration,
    pub store_retry: RetryPolicy,
    /// 1 バッチあたりのストア試行回数（初回を含む）
    pub store_attempts: u32,
    /// ack ログ読み出しの一時障害に対する再試行
    pub backend_retry: RetryPolicy,
    pub backend_attempts: u32,
    /// 未 drain の ack がこれを超えたら毎サイクル warn
    pub backlog_alarm_threshold: usize,
}

/// 1 サイクルの結果
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub stream: StreamName,
    pub drained: usize,
    /// サイクル終了時点のチェックポイント
    pub checkpoint: Option<Offset>,
    /// upsert の試行回数（0 = バッチが空）
    pub store_attempts: u32,
    pub trimmed: usize,
}

pub struct Drainer {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: DrainerConfig,
    liveness: Liveness,
}

impl Drainer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            backend,
            store,
            liveness: Liveness::new(Arc::clone(&clock)),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DrainerConfig {
        &self.config
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// ストリームリースを取る。他の drainer が保持中なら `None`。
    pub async fn acquire(&self, stream: &StreamName) -> Result<Option<StreamLease>, ConveyorError> {
        Ok(self
            .backend
            .acquire_stream_lease(stream, &self.config.holder, self.config.lease_ttl)
            .await?)
    }

    pub async fn release(&self, lease: &StreamLease) -> Result<(), ConveyorError> {
        Ok(self.backend.release_stream_lease(lease).await?)
    }

    /// 1 バッチ分 drain する
    ///
    /// 途中でリースを失ったら `StreamLeaseLost` を返し、チェックポイントは触らない。
    pub async fn drain_once(&self, lease: &mut StreamLease) -> Result<DrainReport, ConveyorError> {
        let stream = lease.stream.clone();
        self.liveness.beat();
        self.renew(lease).await?;

        let (committed, _) = self
            .with_store_retry("checkpoint", || self.store.checkpoint(&stream))
            .await?;
        let after = committed.map(|checkpoint| checkpoint.offset);

        let backlog = self
            .with_backend_retry("ack_backlog", || self.backend.ack_backlog(&stream, after))
            .await?;
        if backlog > self.config.backlog_alarm_threshold {
            warn!(%stream, backlog, threshold = self.config.backlog_alarm_threshold, "ack backlog above alarm threshold");
        }

        let batch = self.collect_batch(&stream, after).await?;
        let Some(highest) = batch.last().map(|ack| ack.offset) else {
            return Ok(DrainReport {
                stream,
                drained: 0,
                checkpoint: after,
                store_attempts: 0,
                trimmed: 0,
            });
        };

        let records: Vec<DurableRecord> = batch.iter().map(DurableRecord::from_ack).collect();
        let (_, store_attempts) = self
            .with_store_retry("upsert_records", || self.store.upsert_records(&records))
            .await?;

        // upsert の再試行中に失効しうるので、コミット直前にもう一度確かめる
        self.renew(lease).await?;

        let checkpoint = DrainCheckpoint {
            stream: stream.clone(),
            offset: highest,
            committed_at: self.clock.now(),
        };
        self.with_store_retry("commit_checkpoint", || {
            self.store.commit_checkpoint(&checkpoint)
        })
        .await?;

        let trimmed = match self.backend.trim_acks(&stream, highest).await {
            Ok(trimmed) => trimmed,
            Err(err) => {
                warn!(%stream, upto = %highest, error = %err, "ack trim failed");
                0
            }
        };

        info!(%stream, drained = records.len(), checkpoint = %highest, store_attempts, trimmed, "batch drained");
        Ok(DrainReport {
            stream,
            drained: records.len(),
            checkpoint: Some(highest),
            store_attempts,
            trimmed,
        })
    }

    /// 同じ保持者としてリースを取り直す。トークンが変わっていれば `StreamLeaseLost`。
    async fn renew(&self, lease: &mut StreamLease) -> Result<(), ConveyorError> {
        let stream = lease.stream.clone();
        let renewed = self
            .with_backend_retry("acquire_stream_lease", || {
                self.backend
                    .acquire_stream_lease(&stream, &self.config.holder, self.config.lease_ttl)
            })
            .await?;
        match renewed {
            Some(renewed) if renewed.token == lease.token => {
                *lease = renewed;
                Ok(())
            }
            _ => {
                warn!(%stream, holder = %self.config.holder, "stream lease lost");
                Err(ConveyorError::StreamLeaseLost(stream))
            }
        }
    }

    /// `batch_size` 件集まるか `flush_interval` が過ぎるまで読む
    async fn collect_batch(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
    ) -> Result<Vec<AckEntry>, ConveyorError> {
        let deadline = Instant::now() + self.config.flush_interval;
        let mut batch: Vec<AckEntry> = Vec::new();
        let mut cursor = after;

        while batch.len() < self.config.batch_size {
            let wait = deadline.saturating_duration_since(Instant::now());
            let want = self.config.batch_size - batch.len();
            let more = self
                .with_backend_retry("read_acks", || {
                    self.backend.read_acks(stream, cursor, want, wait)
                })
                .await?;
            let Some(last) = more.last() else {
                break;
            };
            cursor = Some(last.offset);
            batch.extend(more);
            if wait.is_zero() {
                break;
            }
        }
        Ok(batch)
    }

    /// ストアの一時障害をバックオフで再試行する。戻り値の u32 は試行回数。
    async fn with_store_retry<T, F, Fut>(
        &self,
        op: &str,
        mut call: F,
    ) -> Result<(T, u32), ConveyorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.config.store_retry.backoff(self.config.store_attempts);
        loop {
            match call().await {
                Ok(value) => return Ok((value, backoff.attempts())),
                Err(err) if err.kind().is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(op, attempt = backoff.failures(), ?delay, error = %err, "durable store call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(op, attempts = backoff.failures(), error = %err, "durable store retry budget exhausted, checkpoint withheld");
                        return Err(err.into());
                    }
                },
                Err(err) => {
                    error!(op, error = %err, "durable store rejected the call");
                    return Err(err.into());
                }
            }
        }
    }

    /// キューバックエンドの一時障害をバックオフで再試行する
    async fn with_backend_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ConveyorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut backoff = self
            .config
            .backend_retry
            .backoff(self.config.backend_attempts);
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind().is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(op, attempt = backoff.failures(), ?delay, error = %err, "queue backend call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(op, attempts = backoff.failures(), error = %err, "queue backend retry budget exhausted, drain cycle aborted");
                        return Err(err.into());
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 1 ストリームの drain ループ
    async fn run_stream(&self, stream: StreamName, mut shutdown: watch::Receiver<bool>) {
        let idle = self.config.flush_interval.max(Duration::from_millis(10));
        let mut lease: Option<StreamLease> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.liveness.beat();

            if lease.is_none() {
                match self.acquire(&stream).await {
                    Ok(Some(acquired)) => {
                        info!(%stream, holder = %self.config.holder, "stream lease acquired");
                        lease = Some(acquired);
                    }
                    Ok(None) => debug!(%stream, "stream lease held elsewhere"),
                    Err(err) => warn!(%stream, error = %err, "stream lease acquisition failed"),
                }
            }
            let Some(current) = lease.as_mut() else {
                if pause(&mut shutdown, idle).await {
                    break;
                }
                continue;
            };

            let result = tokio::select! {
                result = self.drain_once(current) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match result {
                Ok(report) => debug!(?report, "drain cycle finished"),
                Err(err) if err.kind() == ErrorKind::Superseded => {
                    info!(%stream, error = %err, "stream taken over, dropping lease");
                    lease = None;
                }
                Err(err) => {
                    // 次のサイクルはチェックポイントから再開する
                    warn!(%stream, error = %err, "drain cycle failed");
                    if pause(&mut shutdown, idle).await {
                        break;
                    }
                }
            }
        }

        if let Some(held) = lease
            && let Err(err) = self.release(&held).await
        {
            warn!(%stream, error = %err, "stream lease release failed");
        }
        info!(%stream, "drainer stopped");
    }

    /// ストリームごとに drain ループを起動する
    pub fn spawn(self: Arc<Self>) -> DrainerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut loops = JoinSet::new();
            for stream in self.config.streams.clone() {
                let drainer = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                loops.spawn(async move { drainer.run_stream(stream, shutdown).await });
            }
            info!(holder = %self.config.holder, streams = self.config.streams.len(), "drainer started");
            while let Some(done) = loops.join_next().await {
                if let Err(err) = done {
                    error!(error = %err, "drain loop panicked");
                }
            }
        });
        DrainerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// `idle` だけ待つ。shutdown が来たら true。
async fn pause(shutdown: &mut watch::Receiver<bool>, idle: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(idle) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

pub struct DrainerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DrainerHandle {
    /// 実行中のサイクルを打ち切ってリースを返す
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.shutdown.send_replace(true);
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AckRecord, FinalStatus, Task, TaskId, TaskKind};
    use crate::impls::{InMemoryDurableStore, InMemoryQueueBackend};
    use crate::ports::{ClaimRequest, ManualClock};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn stream() -> StreamName {
        StreamName::new("payments").unwrap()
    }

    fn config() -> DrainerConfig {
        DrainerConfig {
            holder: ConsumerId::new("drainer-1"),
            streams: vec![stream()],
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_secs(30),
            store_retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            store_attempts: 5,
            backend_retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            backend_attempts: 3,
            backlog_alarm_threshold: 100,
        }
    }

    struct Fixture {
        backend: Arc<InMemoryQueueBackend>,
        store: Arc<InMemoryDurableStore>,
        clock: ManualClock,
        drainer: Drainer,
    }

    fn fixture(config: DrainerConfig) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let backend = Arc::new(InMemoryQueueBackend::new(Arc::new(clock.clone())));
        let store = Arc::new(InMemoryDurableStore::new());
        let drainer = Drainer::new(backend.clone(), store.clone(), Arc::new(clock.clone()), config);
        Fixture {
            backend,
            store,
            clock,
            drainer,
        }
    }

    /// 1 件積んで claim → ack し、task_id を返す
    async fn acked(f: &Fixture) -> TaskId {
        let task_id = TaskId::from_ulid(Ulid::new());
        let task = Task::new(task_id, TaskKind::new("webhook"), serde_json::json!({}), f.clock.now());
        f.backend.append(&stream(), "workers", task).await.unwrap();
        let claimed = f
            .backend
            .claim(&ClaimRequest {
                group: "workers".into(),
                consumer: ConsumerId::new("c1"),
                streams: vec![stream()],
                lease_for: Duration::from_secs(30),
                wait: Duration::ZERO,
            })
            .await
            .unwrap()
            .unwrap();
        let record = AckRecord::succeeded(&claimed.entry, None, f.clock.now());
        f.backend.ack(&claimed.lease, record).await.unwrap();
        task_id
    }

    #[tokio::test]
    async fn drains_batch_and_advances_checkpoint() {
        let f = fixture(config());
        let first = acked(&f).await;
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();

        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!(report.drained, 2);
        assert_eq!(report.checkpoint, Some(Offset(2)));
        assert_eq!(report.store_attempts, 1);
        assert_eq!(report.trimmed, 2);

        let record = f.store.record(first).await.unwrap().unwrap();
        assert_eq!(record.final_status, FinalStatus::Succeeded);
        assert_eq!(record.ack_offset, Offset(1));
        let checkpoint = f.store.checkpoint(&stream()).await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, Offset(2));
        assert!(f.backend.acks(&stream()).await.is_empty());
    }

    #[tokio::test]
    async fn empty_stream_keeps_checkpoint() {
        let f = fixture(config());
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();

        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!(report.drained, 0);
        assert_eq!(report.checkpoint, None);
        assert_eq!(f.store.upsert_statements(), 0);
    }

    #[tokio::test]
    async fn batch_size_caps_one_cycle() {
        let f = fixture(DrainerConfig {
            batch_size: 2,
            ..config()
        });
        for _ in 0..3 {
            acked(&f).await;
        }
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();

        let first = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!((first.drained, first.checkpoint), (2, Some(Offset(2))));
        let second = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!((second.drained, second.checkpoint), (1, Some(Offset(3))));
        assert_eq!(f.store.records().await.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_store_budget_withholds_checkpoint() {
        let f = fixture(DrainerConfig {
            store_attempts: 3,
            ..config()
        });
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        f.store.faults().set_down_on("upsert_records");

        let err = f.drainer.drain_once(&mut lease).await.unwrap_err();
        assert!(matches!(err, ConveyorError::StoreUnavailable(_)));
        assert_eq!(f.store.faults().tripped(), 3);

        f.store.faults().set_down(false);
        assert_eq!(f.store.upsert_statements(), 0);
        assert_eq!(f.store.checkpoint_commits(), 0);
        assert!(f.store.checkpoint(&stream()).await.unwrap().is_none());
        assert_eq!(f.backend.acks(&stream()).await.len(), 1);
    }

    #[tokio::test]
    async fn upsert_retries_within_budget_then_commits() {
        let f = fixture(config());
        for _ in 0..4 {
            acked(&f).await;
        }
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        f.store.faults().fail_next_on("upsert_records", 3);

        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!(report.store_attempts, 4);
        assert_eq!(report.drained, 4);
        assert_eq!(report.checkpoint, Some(Offset(4)));
        assert_eq!(f.store.faults().tripped(), 3);
        assert_eq!(f.store.upsert_statements(), 1);
        assert_eq!(f.store.checkpoint_commits(), 1);
    }

    #[tokio::test]
    async fn each_failed_upsert_leaves_checkpoint_unchanged() {
        let f = fixture(DrainerConfig {
            store_attempts: 1,
            ..config()
        });
        acked(&f).await;
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        f.store.faults().fail_next_on("upsert_records", 3);

        for _ in 0..3 {
            let err = f.drainer.drain_once(&mut lease).await.unwrap_err();
            assert!(matches!(err, ConveyorError::StoreUnavailable(_)));
            assert!(f.store.checkpoint(&stream()).await.unwrap().is_none());
            assert_eq!(f.backend.acks(&stream()).await.len(), 2);
        }

        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!((report.drained, report.checkpoint), (2, Some(Offset(2))));
        assert_eq!(f.store.upsert_statements(), 1);
    }

    #[tokio::test]
    async fn idle_cycles_keep_the_stream_lease() {
        let f = fixture(DrainerConfig {
            lease_ttl: Duration::from_secs(15),
            ..config()
        });
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        let token = lease.token;

        // 20s of empty cycles against a 15s lease.
        for _ in 0..4 {
            let report = f.drainer.drain_once(&mut lease).await.unwrap();
            assert_eq!(report.drained, 0);
            f.clock.advance(Duration::from_secs(5));
        }
        let other = f
            .backend
            .acquire_stream_lease(&stream(), &ConsumerId::new("drainer-2"), Duration::from_secs(15))
            .await
            .unwrap();
        assert!(other.is_none());

        acked(&f).await;
        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(lease.token, token);
        assert_eq!(f.store.upsert_statements(), 1);
        assert!(f.store.checkpoint(&stream()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queue_hiccup_inside_a_cycle_is_retried() {
        let f = fixture(config());
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        f.backend.faults().fail_next_on("read_acks", 2);

        let report = f.drainer.drain_once(&mut lease).await.unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(f.backend.faults().tripped(), 2);
    }

    #[tokio::test]
    async fn queue_outage_beyond_budget_aborts_without_commit() {
        let f = fixture(config());
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        f.backend.faults().set_down_on("ack_backlog");

        let err = f.drainer.drain_once(&mut lease).await.unwrap_err();
        assert!(matches!(err, ConveyorError::QueueUnavailable(_)));
        assert_eq!(f.backend.faults().tripped(), 3);
        f.backend.faults().set_down(false);
        assert!(f.store.checkpoint(&stream()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_lease_does_not_commit() {
        let f = fixture(config());
        acked(&f).await;
        let mut lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();

        // The lease lapses and another drainer takes it over.
        f.clock.advance(Duration::from_secs(30));
        let thief = f
            .backend
            .acquire_stream_lease(&stream(), &ConsumerId::new("drainer-2"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(thief.is_some());

        let err = f.drainer.drain_once(&mut lease).await.unwrap_err();
        assert!(matches!(err, ConveyorError::StreamLeaseLost(_)));
        assert!(f.store.checkpoint(&stream()).await.unwrap().is_none());
        assert_eq!(f.backend.acks(&stream()).await.len(), 1);
    }

    #[tokio::test]
    async fn second_drainer_cannot_take_a_held_stream() {
        let f = fixture(config());
        let _lease = f.drainer.acquire(&stream()).await.unwrap().unwrap();
        let other = Drainer::new(
            f.backend.clone(),
            f.store.clone(),
            Arc::new(f.clock.clone()),
            DrainerConfig {
                holder: ConsumerId::new("drainer-2"),
                ..config()
            },
        );
        assert!(other.acquire(&stream()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawned_drainer_drains_and_releases_lease() {
        let clock = ManualClock::new(Utc::now());
        let backend = Arc::new(InMemoryQueueBackend::new(Arc::new(clock.clone())));
        let store = Arc::new(InMemoryDurableStore::new());
        let f = Fixture {
            backend: backend.clone(),
            store: store.clone(),
            clock: clock.clone(),
            drainer: Drainer::new(backend.clone(), store.clone(), Arc::new(clock.clone()), config()),
        };
        let task_id = acked(&f).await;
        let handle = Arc::new(f.drainer).spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.record(task_id).await.unwrap().is_none() {
            assert!(Instant::now() < deadline, "drainer did not persist the ack");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await.unwrap();

        let reacquired = backend
            .acquire_stream_lease(&stream(), &ConsumerId::new("drainer-2"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }
}
