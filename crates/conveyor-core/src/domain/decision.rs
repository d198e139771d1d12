//! Decision model: what happens to an entry after one attempt.
//!
//! The Decider is pure. Carrying out a Decision (ack, re-append, park) is the
//! consumer's job.

use std::time::Duration;

use super::{Outcome, OutcomeKind, Task};
use crate::queue::RetryPolicy;

/// The next action for a claimed entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Append a Succeeded ack and release the lease.
    Complete,

    /// Retire the entry and re-append it as Pending after `delay`.
    Retry { delay: Duration, attempt_count: u32 },

    /// Park the task and append a DeadLettered ack.
    DeadLetter { reason: String, attempt_count: u32 },
}

/// Decides the next action from the task as claimed and the attempt's outcome.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, outcome: &Outcome) -> Decision;
}

/// Attempt-budget decider with exponential backoff.
///
/// - Success: complete.
/// - Poison: dead letter now, whatever the attempt count.
/// - Failure: `attempt_count + 1`; dead letter once that reaches `max_attempts`,
///   otherwise retry after a jittered delay.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry_policy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), 5)
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, outcome: &Outcome) -> Decision {
        let reason = || outcome.reason.clone().unwrap_or_else(|| "unspecified".into());
        match outcome.kind {
            OutcomeKind::Success => Decision::Complete,
            OutcomeKind::Poison => Decision::DeadLetter {
                reason: format!("poison: {}", reason()),
                attempt_count: task.attempt_count() + 1,
            },
            OutcomeKind::Failure => {
                let attempt_count = task.attempt_count() + 1;
                if attempt_count >= self.max_attempts {
                    Decision::DeadLetter {
                        reason: format!(
                            "max attempts reached ({}/{}): {}",
                            attempt_count,
                            self.max_attempts,
                            reason()
                        ),
                        attempt_count,
                    }
                } else {
                    Decision::Retry {
                        delay: self.retry_policy.jittered_delay(attempt_count),
                        attempt_count,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskKind};
    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    fn task_with_attempts(attempts: u32) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("webhook"),
            serde_json::json!({}),
            Utc::now(),
        )
        .for_retry(attempts, Utc::now())
    }

    fn decider() -> DefaultDecider {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        DefaultDecider::new(policy, 3)
    }

    #[test]
    fn success_completes() {
        let d = decider().decide(&task_with_attempts(2), &Outcome::success());
        assert_eq!(d, Decision::Complete);
    }

    #[rstest]
    #[case(0, Some(Duration::from_secs(2)))]
    #[case(1, Some(Duration::from_secs(4)))]
    #[case(2, None)]
    fn failure_retries_until_budget(#[case] attempts: u32, #[case] delay: Option<Duration>) {
        let d = decider().decide(&task_with_attempts(attempts), &Outcome::failure("boom"));
        match (d, delay) {
            (Decision::Retry { delay: got, attempt_count }, Some(want)) => {
                assert_eq!(got, want);
                assert_eq!(attempt_count, attempts + 1);
            }
            (Decision::DeadLetter { attempt_count, reason }, None) => {
                assert_eq!(attempt_count, 3);
                assert!(reason.contains("boom"));
            }
            (other, _) => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn poison_is_dead_lettered_on_first_attempt() {
        let d = decider().decide(&task_with_attempts(0), &Outcome::poison("bad json"));
        assert!(matches!(d, Decision::DeadLetter { attempt_count: 1, .. }));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let d = DefaultDecider::new(RetryPolicy::default(), 0);
        assert_eq!(d.max_attempts(), 1);
        let decision = d.decide(&task_with_attempts(0), &Outcome::failure("x"));
        assert!(matches!(decision, Decision::DeadLetter { .. }));
    }
}
