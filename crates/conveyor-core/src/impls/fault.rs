//! Failure injection for the in-memory implementations.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Makes operations fail on demand: the next `n` calls, or every call while down.
///
/// The `*_on` variants scope the fault to one operation name; other
/// operations pass and do not consume the budget. Clones share the same switches.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<FaultState>,
}

#[derive(Debug, Default)]
struct FaultState {
    remaining: AtomicU32,
    down: AtomicBool,
    tripped: AtomicU32,
    /// `None` = every operation
    target: Mutex<Option<String>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` operations, then recover.
    pub fn fail_next(&self, n: u32) {
        *self.target() = None;
        self.inner.remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls of `op` only.
    pub fn fail_next_on(&self, op: &str, n: u32) {
        *self.target() = Some(op.to_string());
        self.inner.remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every operation until called again with `false`.
    pub fn set_down(&self, down: bool) {
        if down {
            *self.target() = None;
        }
        self.inner.down.store(down, Ordering::SeqCst);
    }

    /// Fail every call of `op` until `set_down(false)`.
    pub fn set_down_on(&self, op: &str) {
        *self.target() = Some(op.to_string());
        self.inner.down.store(true, Ordering::SeqCst);
    }

    fn target(&self) -> MutexGuard<'_, Option<String>> {
        self.inner.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of operations failed so far.
    pub fn tripped(&self) -> u32 {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Called at the top of every faultable operation.
    pub fn trip(&self, op: &str) -> Result<(), String> {
        if self.target().as_deref().is_some_and(|target| target != op) {
            return Ok(());
        }
        let fail = self.inner.down.load(Ordering::SeqCst)
            || self
                .inner
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            self.inner.tripped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(op, "injected fault");
            Err(format!("injected fault during {op}"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_exactly_n_times() {
        let faults = FaultInjector::new();
        faults.fail_next(2);
        assert!(faults.trip("write").is_err());
        assert!(faults.trip("write").is_err());
        assert!(faults.trip("write").is_ok());
        assert_eq!(faults.tripped(), 2);
    }

    #[test]
    fn down_fails_until_restored() {
        let faults = FaultInjector::new();
        let shared = faults.clone();
        shared.set_down(true);
        for _ in 0..5 {
            assert!(faults.trip("read").is_err());
        }
        shared.set_down(false);
        assert!(faults.trip("read").is_ok());
    }

    #[test]
    fn scoped_fault_skips_other_operations() {
        let faults = FaultInjector::new();
        faults.fail_next_on("upsert_records", 2);
        assert!(faults.trip("checkpoint").is_ok());
        assert!(faults.trip("upsert_records").is_err());
        assert!(faults.trip("checkpoint").is_ok());
        assert!(faults.trip("upsert_records").is_err());
        assert!(faults.trip("upsert_records").is_ok());
        assert_eq!(faults.tripped(), 2);

        faults.set_down_on("commit_checkpoint");
        assert!(faults.trip("upsert_records").is_ok());
        assert!(faults.trip("commit_checkpoint").is_err());
        faults.set_down(false);
        assert!(faults.trip("commit_checkpoint").is_ok());
    }
}
