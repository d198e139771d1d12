use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Per-stream snapshot for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Pending entries, including ones scheduled in the future.
    pub pending: usize,
    pub claimed: usize,
    pub succeeded: usize,
    /// Entries retired by a retry (their successor is counted as pending).
    pub failed: usize,
    pub dead_lettered: usize,
    /// Ack records not yet trimmed by the drainer.
    pub ack_backlog: usize,
    /// Dead letters currently parked (replayed or purged ones are gone).
    pub dead_letters_parked: usize,
}

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG`, `info` otherwise. Calling it twice is a no-op.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
