//! Queue support: retry/backoff policy and shard routing.

mod retry;
mod shard;

pub use retry::{Backoff, RetryPolicy};
pub use shard::shard_index;
