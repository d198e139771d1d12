//! Consumer - claim → handle → decide → ack / nack / dead letter
//!
//! エントリごとの状態遷移: Pending → Claimed → {Succeeded | Pending(retry) | DeadLettered}
//!
//! - claim はストリームを毎回ローテーションして公平に回す
//! - ハンドラ実行中は `lease_duration × heartbeat_fraction` ごとにリースを延長する
//! - 期限切れはハンドラ失敗として数える（future は drop）
//! - リースを失ったら何も書かずに手放す（別のコンシューマが続きをやる）

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{App, Liveness, TaskContext};
use crate::domain::{
    AckRecord, ClaimLease, Claimed, ConsumerId, ConveyorError, Decider, Decision, DefaultDecider,
    Offset, Outcome, QueueEntry, StreamName, TaskId,
};
use crate::ports::clock::span;
use crate::ports::{ClaimRequest, Clock, QueueBackend, QueueError};
use crate::queue::RetryPolicy;
use crate::typed::DynHandler;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_id: ConsumerId,
    pub group: String,
    pub streams: Vec<StreamName>,
    pub lease_duration: Duration,
    /// リース延長の間隔（lease_duration に対する比率, 0 < x < 1）
    pub heartbeat_fraction: f64,
    pub handler_timeout: Duration,
    /// claim で待つ最大時間
    pub poll_wait: Duration,
    /// 同時に実行するハンドラ数
    pub concurrency: usize,
    /// ハンドラ失敗の上限（到達で dead letter）
    pub max_attempts: u32,
    /// ハンドラ失敗後の再実行までの遅延
    pub retry_policy: RetryPolicy,
    /// ack/nack がバックエンド障害で失敗したときのローカルリトライ
    pub backend_retry: RetryPolicy,
    pub backend_attempts: u32,
}

/// 1 エントリの処理結果
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Succeeded {
        task_id: TaskId,
        ack_offset: Offset,
    },
    Retried {
        task_id: TaskId,
        attempt_count: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        task_id: TaskId,
        attempt_count: u32,
        reason: String,
    },
    /// リースを失ったので何も書かなかった
    Abandoned { task_id: TaskId },
}

enum Attempt {
    Finished(Result<Outcome, ConveyorError>),
    TimedOut,
    LeaseLost,
}

pub struct Consumer {
    backend: Arc<dyn QueueBackend>,
    app: App,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    liveness: Liveness,
    cursor: AtomicUsize,
}

impl Consumer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        app: App,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        let decider = Arc::new(DefaultDecider::new(
            config.retry_policy.clone(),
            config.max_attempts,
        ));
        Self {
            backend,
            app,
            decider,
            liveness: Liveness::new(Arc::clone(&clock)),
            clock,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// 今回の claim で探すストリーム順（呼ぶたびに 1 つずつずらす）
    fn rotated_streams(&self) -> Vec<StreamName> {
        let streams = &self.config.streams;
        if streams.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % streams.len();
        streams[start..]
            .iter()
            .chain(&streams[..start])
            .cloned()
            .collect()
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config
            .lease_duration
            .mul_f64(self.config.heartbeat_fraction.clamp(0.0, 1.0))
            .max(Duration::from_millis(1))
    }

    /// 1 回だけ claim を試みる。`wait` の間に何も無ければ `None`。
    pub async fn poll_once(&self, wait: Duration) -> Result<Option<Claimed>, ConveyorError> {
        self.liveness.beat();
        let request = ClaimRequest {
            group: self.config.group.clone(),
            consumer: self.config.consumer_id.clone(),
            streams: self.rotated_streams(),
            lease_for: self.config.lease_duration,
            wait,
        };
        Ok(self.backend.claim(&request).await?)
    }

    /// claim して 1 件処理する
    pub async fn process_next(&self) -> Result<Option<Processed>, ConveyorError> {
        match self.poll_once(self.config.poll_wait).await? {
            Some(claimed) => self.execute(claimed).await.map(Some),
            None => Ok(None),
        }
    }

    /// claim 済みのエントリを実行して決着させる
    pub async fn execute(&self, claimed: Claimed) -> Result<Processed, ConveyorError> {
        let Claimed { entry, mut lease } = claimed;
        let task_id = entry.task.task_id();
        let kind = entry.task.kind().clone();
        debug!(%task_id, %kind, stream = %entry.stream, offset = %entry.offset, attempt = entry.task.attempt_count() + 1, "executing task");

        let outcome = match self.app.registry.get(kind.as_str()) {
            None => Outcome::poison(format!("no handler registered for kind {kind}")),
            Some(handler) => match self.run_handler(handler, &entry, &mut lease).await {
                Attempt::Finished(Ok(outcome)) => outcome,
                Attempt::Finished(Err(ConveyorError::PoisonPayload(reason))) => {
                    Outcome::poison(reason)
                }
                Attempt::Finished(Err(err)) => Outcome::failure(err.to_string()),
                Attempt::TimedOut => Outcome::failure(format!(
                    "handler deadline of {:?} elapsed",
                    self.config.handler_timeout
                )),
                Attempt::LeaseLost => {
                    warn!(%task_id, stream = %entry.stream, offset = %entry.offset, "lease lost during execution, abandoning");
                    return Ok(Processed::Abandoned { task_id });
                }
            },
        };

        match self.settle(&entry, &lease, &outcome).await {
            Ok(processed) => Ok(processed),
            Err(QueueError::LeaseLost { .. }) => {
                warn!(%task_id, stream = %entry.stream, offset = %entry.offset, "lease expired before settling, abandoning");
                Ok(Processed::Abandoned { task_id })
            }
            Err(err) => {
                error!(%task_id, stream = %entry.stream, offset = %entry.offset, error = %err, "could not settle task");
                Err(err.into())
            }
        }
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn DynHandler>,
        entry: &QueueEntry,
        lease: &mut ClaimLease,
    ) -> Attempt {
        let task = &entry.task;
        let (ctx, cancel) = TaskContext::new(
            task.task_id(),
            task.kind().clone(),
            task.attempt_count() + 1,
            self.config.handler_timeout,
        );
        let deadline = tokio::time::sleep_until(ctx.deadline());
        tokio::pin!(deadline);
        let mut run = handler.handle_dyn(task.payload().clone(), ctx);

        let every = self.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                result = &mut run => return Attempt::Finished(result),
                _ = &mut deadline => {
                    cancel.cancel();
                    return Attempt::TimedOut;
                }
                _ = heartbeat.tick() => {
                    match self.backend.renew(lease, self.config.lease_duration).await {
                        Ok(renewed) => *lease = renewed,
                        Err(QueueError::LeaseLost { .. }) => {
                            cancel.cancel();
                            return Attempt::LeaseLost;
                        }
                        Err(err) => {
                            warn!(task_id = %task.task_id(), error = %err, "lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    async fn settle(
        &self,
        entry: &QueueEntry,
        lease: &ClaimLease,
        outcome: &Outcome,
    ) -> Result<Processed, QueueError> {
        let task_id = entry.task.task_id();
        let now = self.clock.now();

        match self.decider.decide(&entry.task, outcome) {
            Decision::Complete => {
                let record = AckRecord::succeeded(entry, outcome.result.clone(), now);
                let ack_offset = self
                    .retry_backend("ack", move || self.backend.ack(lease, record.clone()))
                    .await?;
                info!(%task_id, stream = %entry.stream, %ack_offset, "task succeeded");
                Ok(Processed::Succeeded {
                    task_id,
                    ack_offset,
                })
            }
            Decision::Retry {
                delay,
                attempt_count,
            } => {
                let retry_at = now + span(delay);
                let retry = entry.task.for_retry(attempt_count, retry_at);
                let offset = self
                    .retry_backend("nack", move || self.backend.nack(lease, retry.clone()))
                    .await?;
                info!(%task_id, stream = %entry.stream, attempt = attempt_count, %offset, %retry_at, reason = outcome.reason.as_deref().unwrap_or(""), "task failed, retry scheduled");
                Ok(Processed::Retried {
                    task_id,
                    attempt_count,
                    retry_at,
                })
            }
            Decision::DeadLetter {
                reason,
                attempt_count,
            } => {
                let parked = entry.task.dead_lettered(attempt_count);
                let record = AckRecord::dead_lettered(entry, attempt_count, reason.clone(), now);
                let ack_offset = self
                    .retry_backend("dead_letter", || {
                        self.backend
                            .dead_letter(lease, parked.clone(), reason.clone(), record.clone())
                    })
                    .await?;
                warn!(%task_id, stream = %entry.stream, attempt = attempt_count, %ack_offset, %reason, "task dead-lettered");
                Ok(Processed::DeadLettered {
                    task_id,
                    attempt_count,
                    reason,
                })
            }
        }
    }

    /// 一時的なバックエンド障害をバックオフ付きでリトライする
    async fn retry_backend<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, QueueError>
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
                Err(err) if err.kind().is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(op, attempt = backoff.failures(), ?delay, error = %err, "backend call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                other => return other,
            }
        }
    }

    /// poll ループを起動する
    ///
    /// 空きスロット（セマフォ）があるときだけ claim し、実行はプールに投げる。
    pub fn spawn(self: Arc<Self>) -> ConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
            let mut in_flight: JoinSet<Result<Processed, ConveyorError>> = JoinSet::new();
            info!(consumer = %self.config.consumer_id, group = %self.config.group, streams = self.config.streams.len(), "consumer started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                self.liveness.beat();
                while let Some(done) = in_flight.try_join_next() {
                    log_execution(done);
                }

                let permit = tokio::select! {
                    permit = tokio::time::timeout(self.config.poll_wait, Arc::clone(&slots).acquire_owned()) => match permit {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => break,
                        Err(_) => continue,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let claimed = tokio::select! {
                    claimed = self.poll_once(self.config.poll_wait) => claimed,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                match claimed {
                    Ok(Some(claimed)) => {
                        let consumer = Arc::clone(&self);
                        in_flight.spawn(async move {
                            let _permit = permit;
                            consumer.execute(claimed).await
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "claim failed");
                        tokio::time::sleep(self.config.poll_wait.max(Duration::from_millis(10))).await;
                    }
                }
            }

            info!(consumer = %self.config.consumer_id, in_flight = in_flight.len(), "consumer stopping, waiting for in-flight tasks");
            while let Some(done) = in_flight.join_next().await {
                log_execution(done);
            }
            info!(consumer = %self.config.consumer_id, "consumer stopped");
        });

        ConsumerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

fn log_execution(done: Result<Result<Processed, ConveyorError>, JoinError>) {
    match done {
        Ok(Ok(processed)) => debug!(?processed, "task processed"),
        Ok(Err(err)) => error!(error = %err, "task execution failed"),
        Err(err) => error!(error = %err, "task execution panicked"),
    }
}

/// 起動中の poll ループ
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    /// poll を止め、実行中のタスクが終わるのを待つ
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.shutdown.send_replace(true);
        self.join.await
    }
}
