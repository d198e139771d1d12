//! Liveness - ループの生存確認
//!
//! poll ループが毎周 `beat()` する。起動順序（consumer が生きてから producer）の
//! ゲートに使う。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::ports::Clock;
use crate::ports::clock::span;

const NEVER: i64 = i64::MIN;

#[derive(Clone)]
pub struct Liveness {
    last_beat_ms: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
}

impl Liveness {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_beat_ms: Arc::new(AtomicI64::new(NEVER)),
            clock,
        }
    }

    pub fn beat(&self) {
        let now = self.clock.now().timestamp_millis();
        self.last_beat_ms.store(now, Ordering::SeqCst);
    }

    /// `window` 以内に beat があれば true
    pub fn is_live(&self, window: Duration) -> bool {
        let last = self.last_beat_ms.load(Ordering::SeqCst);
        if last == NEVER {
            return false;
        }
        let now = self.clock.now().timestamp_millis();
        now.saturating_sub(last) <= span(window).num_milliseconds()
    }

    /// live になるまで `poll` 間隔で確認する。`timeout` を過ぎたら false。
    pub async fn wait_until_live(&self, window: Duration, poll: Duration, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_live(window) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

impl std::fmt::Debug for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liveness")
            .field("last_beat_ms", &self.last_beat_ms.load(Ordering::SeqCst))
            .finish()
    }
}
