use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use clap::Parser;
use miette::{IntoDiagnostic, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};
use tracing::info;

use conveyor_core::app::{AppBuilder, Consumer, Drainer, Producer, TaskContext};
use conveyor_core::config::ConveyorConfig;
use conveyor_core::domain::{ConveyorError, Outcome, TaskId};
use conveyor_core::impls::{InMemoryDurableStore, InMemoryQueueBackend, ShardedQueueBackend};
use conveyor_core::observability::init_tracing;
use conveyor_core::ports::{Clock, DurableStore, QueueBackend, SystemClock};
use conveyor_core::typed::{Handler, Task};

#[derive(Parser)]
#[command(author, version, about = "Run a producer, consumer and drainer against in-memory backends", long_about = None)]
struct Cli {
    /// JSON config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Number of tasks to enqueue
    #[arg(long, default_value_t = 10)]
    tasks: usize,

    /// How many payment retries fail before they start succeeding
    #[arg(long, default_value_t = 1)]
    fail_first: u32,

    /// Give up waiting for durable records after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryPayment {
    payment_id: String,
    amount: i64,
}

impl Task for RetryPayment {
    const KIND: &'static str = "retry_payment";
}

#[derive(Debug, Serialize, Deserialize)]
struct Webhook {
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl Task for Webhook {
    const KIND: &'static str = "webhook";
}

/// 最初の N 回だけ失敗する
struct RetryPaymentHandler {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<RetryPayment> for RetryPaymentHandler {
    async fn handle(&self, task: RetryPayment, ctx: TaskContext) -> Result<Outcome, ConveyorError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ConveyorError::HandlerFailure(format!(
                "payment gateway timeout (attempt {})",
                ctx.attempt()
            )));
        }
        Ok(Outcome::success_with(serde_json::json!({
            "payment_id": task.payment_id,
            "charged": task.amount,
        })))
    }
}

struct WebhookHandler;

#[async_trait]
impl Handler<Webhook> for WebhookHandler {
    async fn handle(&self, task: Webhook, _ctx: TaskContext) -> Result<Outcome, ConveyorError> {
        info!(url = %task.url, headers = task.headers.len(), "webhook delivered");
        Ok(Outcome::success())
    }
}

fn build_backend(config: &ConveyorConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn QueueBackend>> {
    let shard = || -> Arc<dyn QueueBackend> {
        Arc::new(
            InMemoryQueueBackend::new(Arc::clone(&clock))
                .with_max_entry_bytes(config.queue.max_entry_bytes),
        )
    };
    if config.queue.shards <= 1 {
        return Ok(shard());
    }
    let shards = (0..config.queue.shards).map(|_| shard()).collect();
    match ShardedQueueBackend::new(shards) {
        Some(sharded) => Ok(Arc::new(sharded)),
        None => bail!("queue.shards must be at least 1"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => ConveyorConfig::from_path(path).into_diagnostic()?,
        None => ConveyorConfig::default(),
    };

    // (A) バックエンドとハンドラを用意
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = build_backend(&config, Arc::clone(&clock))?;
    let store = Arc::new(InMemoryDurableStore::new());

    let app = AppBuilder::new()
        .register::<RetryPayment, _>(RetryPaymentHandler {
            remaining_failures: AtomicU32::new(cli.fail_first),
        })
        .into_diagnostic()?
        .register::<Webhook, _>(WebhookHandler)
        .into_diagnostic()?
        .expect_kinds(&[RetryPayment::KIND, Webhook::KIND])
        .build()
        .into_diagnostic()?;

    // (B) consumer を起動し、生きていることを確認してから producer を動かす
    let consumer = Arc::new(Consumer::new(
        Arc::clone(&backend),
        app,
        Arc::clone(&clock),
        config.consumer_config(),
    ));
    let liveness = consumer.liveness();
    let consumer_handle = Arc::clone(&consumer).spawn();

    let live = liveness
        .wait_until_live(Duration::from_secs(5), Duration::from_millis(20), Duration::from_secs(10))
        .await;
    if !live {
        bail!("consumer did not report liveness; refusing to start the producer");
    }

    let drainer = Arc::new(Drainer::new(
        Arc::clone(&backend),
        store.clone(),
        Arc::clone(&clock),
        config.drainer_config(),
    ));
    let drainer_handle = drainer.spawn();

    // (C) タスク投入
    let producer = Producer::new(
        Arc::clone(&backend),
        Arc::clone(&clock),
        config.producer_config().into_diagnostic()?,
    );
    let mut task_ids: Vec<TaskId> = Vec::with_capacity(cli.tasks);
    for i in 0..cli.tasks {
        let task_id = if i % 2 == 0 {
            let task = RetryPayment {
                payment_id: format!("pay_{i:04}"),
                amount: 1_000 + i as i64,
            };
            producer.enqueue_task(&task, None).await.into_diagnostic()?
        } else {
            let task = Webhook {
                url: format!("https://hooks.example.test/orders/{i}"),
                headers: BTreeMap::from([("x-attempt".to_string(), "1".to_string())]),
            };
            producer.enqueue_task(&task, None).await.into_diagnostic()?
        };
        task_ids.push(task_id);
    }
    info!(tasks = task_ids.len(), "tasks enqueued");

    // (D) 全タスクの正本レコードが揃うまで待つ
    let deadline = Instant::now() + Duration::from_secs(cli.timeout_secs);
    let waited = tokio::select! {
        done = wait_for_records(store.as_ref(), &task_ids, deadline) => done.into_diagnostic()?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            false
        }
    };

    // (E) 停止して集計を出す
    consumer_handle.shutdown().await.into_diagnostic()?;
    drainer_handle.shutdown().await.into_diagnostic()?;

    for stream in &config.queue.streams {
        let counts = backend.counts(stream).await.into_diagnostic()?;
        println!(
            "stream {stream}: {}",
            serde_json::to_string(&counts).into_diagnostic()?
        );
    }
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for record in store.records().await {
        *by_status.entry(record.final_status.to_string()).or_default() += 1;
    }
    println!("durable records: {by_status:?}");

    if !waited {
        bail!("not every task reached the durable store");
    }
    Ok(())
}

async fn wait_for_records(
    store: &dyn DurableStore,
    task_ids: &[TaskId],
    deadline: Instant,
) -> std::result::Result<bool, ConveyorError> {
    let mut pending: Vec<TaskId> = task_ids.to_vec();
    while !pending.is_empty() {
        if Instant::now() >= deadline {
            return Ok(false);
        }
        let mut still = Vec::with_capacity(pending.len());
        for task_id in pending {
            if store.record(task_id).await?.is_none() {
                still.push(task_id);
            }
        }
        pending = still;
        if !pending.is_empty() {
            sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(true)
}
