//! TaskContext - ハンドラに渡す実行コンテキスト
//!
//! 期限（deadline）とキャンセル信号を運ぶ。キャンセルは協調的で、
//! 期限を過ぎた future を consumer が drop するのが最後の砦。

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{TaskId, TaskKind};

#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    kind: TaskKind,
    attempt: u32,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

/// キャンセル側のハンドル。drop してもキャンセルにはならない。
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl TaskContext {
    /// `attempt` は 1 始まり（初回 = 1）
    pub fn new(
        task_id: TaskId,
        kind: TaskKind,
        attempt: u32,
        timeout: Duration,
    ) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            task_id,
            kind,
            attempt,
            deadline: Instant::now() + timeout,
            cancel: rx,
        };
        (ctx, CancelHandle { tx })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || Instant::now() >= self.deadline
    }

    /// キャンセルされるか期限が来るまで待つ
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let signalled = async move {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = signalled => {},
            _ = tokio::time::sleep_until(self.deadline) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn context(timeout: Duration) -> (TaskContext, CancelHandle) {
        TaskContext::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("webhook"),
            1,
            timeout,
        )
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (ctx, handle) = context(Duration::from_secs(60));
        assert!(!ctx.is_cancelled());

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.cancelled().await }
        });
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_counts_as_cancellation() {
        let (ctx, _handle) = context(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (ctx, handle) = context(Duration::from_millis(50));
        drop(handle);
        assert!(!ctx.is_cancelled());
        let early = tokio::time::timeout(Duration::from_millis(10), ctx.cancelled()).await;
        assert!(early.is_err());
    }
}
