//! Runtime configuration.
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid config.
//! Durations are plain millisecond integers (`*_ms`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{ConsumerConfig, DrainerConfig, ProducerConfig};
use crate::domain::{ConsumerId, ConveyorError, StreamName};
use crate::impls::inmem_backend::DEFAULT_MAX_ENTRY_BYTES;
use crate::queue::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ConveyorError {
    fn from(err: ConfigError) -> Self {
        ConveyorError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub queue: QueueSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub drainer: DrainerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub consumer_group: String,
    /// The first stream is the producer's default target.
    pub streams: Vec<StreamName>,
    pub max_entry_bytes: usize,
    /// Number of backend shards streams are hashed across.
    pub shards: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            consumer_group: "workers".to_string(),
            streams: vec![StreamName::default()],
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            shards: 1,
        }
    }
}

/// Backoff settings plus the attempt budget they apply to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// Tries including the first one.
    pub max_attempts: u32,
}

impl RetrySettings {
    fn with_base(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(format!("{name}.max_attempts must be at least 1")));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(format!("{name}.jitter must be within [0, 1]")));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(invalid(format!("{name}.multiplier must be >= 1")));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "{name}.base_delay_ms must not exceed max_delay_ms"
            )));
        }
        Ok(())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Backoff while the queue backend is unreachable.
    pub retry: RetrySettings,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::with_base(200, 5_000, 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub consumer_id: String,
    pub lease_duration_ms: u64,
    pub heartbeat_fraction: f64,
    pub handler_timeout_ms: u64,
    pub poll_wait_ms: u64,
    pub concurrency: usize,
    /// Handler retries; `max_attempts` is the dead-letter threshold.
    pub retry: RetrySettings,
    /// Local retries of ack/nack while the backend is unreachable.
    pub backend_retry: RetrySettings,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            consumer_id: "consumer-1".to_string(),
            lease_duration_ms: 30_000,
            heartbeat_fraction: 0.3,
            handler_timeout_ms: 10_000,
            poll_wait_ms: 500,
            concurrency: 4,
            retry: RetrySettings::default(),
            backend_retry: RetrySettings::with_base(100, 2_000, 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainerSettings {
    pub holder: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Renewed every cycle, so it must outlast `flush_interval_ms`.
    pub lease_ttl_ms: u64,
    pub store_retry: RetrySettings,
    /// Local retries of ack log reads and lease renewal.
    pub backend_retry: RetrySettings,
    pub backlog_alarm_threshold: usize,
}

impl Default for DrainerSettings {
    fn default() -> Self {
        Self {
            holder: "drainer-1".to_string(),
            batch_size: 100,
            flush_interval_ms: 1_000,
            lease_ttl_ms: 15_000,
            store_retry: RetrySettings::with_base(500, 10_000, 5),
            backend_retry: RetrySettings::with_base(100, 2_000, 5),
            backlog_alarm_threshold: 10_000,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl ConveyorConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// 起動時検証（Fail-fast）
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.queue;
        if queue.streams.is_empty() {
            return Err(invalid("queue.streams must not be empty"));
        }
        if queue.shards == 0 {
            return Err(invalid("queue.shards must be at least 1"));
        }
        if queue.max_entry_bytes == 0 {
            return Err(invalid("queue.max_entry_bytes must be positive"));
        }

        let consumer = &self.consumer;
        if consumer.lease_duration_ms <= consumer.handler_timeout_ms {
            return Err(invalid(format!(
                "consumer.lease_duration_ms ({}) must exceed handler_timeout_ms ({})",
                consumer.lease_duration_ms, consumer.handler_timeout_ms
            )));
        }
        if !(consumer.heartbeat_fraction > 0.0 && consumer.heartbeat_fraction < 1.0) {
            return Err(invalid("consumer.heartbeat_fraction must be within (0, 1)"));
        }
        if consumer.concurrency == 0 {
            return Err(invalid("consumer.concurrency must be at least 1"));
        }
        if self.drainer.batch_size == 0 {
            return Err(invalid("drainer.batch_size must be at least 1"));
        }
        if self.drainer.lease_ttl_ms <= self.drainer.flush_interval_ms {
            return Err(invalid(format!(
                "drainer.lease_ttl_ms ({}) must exceed flush_interval_ms ({})",
                self.drainer.lease_ttl_ms, self.drainer.flush_interval_ms
            )));
        }

        self.producer.retry.validate("producer.retry")?;
        consumer.retry.validate("consumer.retry")?;
        consumer.backend_retry.validate("consumer.backend_retry")?;
        self.drainer.store_retry.validate("drainer.store_retry")?;
        self.drainer.backend_retry.validate("drainer.backend_retry")?;
        Ok(())
    }

    /// Producer writes to the first configured stream.
    pub fn producer_config(&self) -> Result<ProducerConfig, ConfigError> {
        let stream = self
            .queue
            .streams
            .first()
            .cloned()
            .ok_or_else(|| invalid("queue.streams must not be empty"))?;
        Ok(ProducerConfig {
            stream,
            consumer_group: self.queue.consumer_group.clone(),
            retry_policy: self.producer.retry.policy(),
            max_attempts: self.producer.retry.max_attempts,
        })
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let c = &self.consumer;
        ConsumerConfig {
            consumer_id: ConsumerId::new(c.consumer_id.clone()),
            group: self.queue.consumer_group.clone(),
            streams: self.queue.streams.clone(),
            lease_duration: Duration::from_millis(c.lease_duration_ms),
            heartbeat_fraction: c.heartbeat_fraction,
            handler_timeout: Duration::from_millis(c.handler_timeout_ms),
            poll_wait: Duration::from_millis(c.poll_wait_ms),
            concurrency: c.concurrency,
            max_attempts: c.retry.max_attempts,
            retry_policy: c.retry.policy(),
            backend_retry: c.backend_retry.policy(),
            backend_attempts: c.backend_retry.max_attempts,
        }
    }

    pub fn drainer_config(&self) -> DrainerConfig {
        let d = &self.drainer;
        DrainerConfig {
            holder: ConsumerId::new(d.holder.clone()),
            streams: self.queue.streams.clone(),
            batch_size: d.batch_size,
            flush_interval: Duration::from_millis(d.flush_interval_ms),
            lease_ttl: Duration::from_millis(d.lease_ttl_ms),
            store_retry: d.store_retry.policy(),
            store_attempts: d.store_retry.max_attempts,
            backend_retry: d.backend_retry.policy(),
            backend_attempts: d.backend_retry.max_attempts,
            backlog_alarm_threshold: d.backlog_alarm_threshold,
        }
    }
}
