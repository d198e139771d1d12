//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and jitter.
///
/// Used for handler retries (delay before the entry is eligible again) and for
/// local retries of transient infrastructure errors (queue/store unreachable).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try, given the number of failures so far (1-indexed).
    ///
    /// delay = min(base_delay * multiplier^(failures - 1), max_delay)
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - failure 1: 2s
    /// - failure 2: 4s
    /// - failure 3: 8s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// `next_delay` with up to `jitter` of it removed at random.
    ///
    /// Never exceeds `next_delay(failures)`, never goes below
    /// `(1 - jitter) * next_delay(failures)`.
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let delay = self.next_delay(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        delay.mul_f64(1.0 - shave)
    }

    /// Bounded retry loop state for transient errors.
    pub fn backoff(&self, max_attempts: u32) -> Backoff<'_> {
        Backoff {
            policy: self,
            max_attempts: max_attempts.max(1),
            failures: 0,
        }
    }
}

/// Counts failed tries of one operation against a budget.
///
/// ```ignore
/// let mut backoff = policy.backoff(5);
/// loop {
///     match op().await {
///         Ok(v) => break v,
///         Err(e) => match backoff.next_delay() {
///             Some(delay) => tokio::time::sleep(delay).await,
///             None => return Err(e),
///         },
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    max_attempts: u32,
    failures: u32,
}

impl Backoff<'_> {
    /// Record a failure. Returns the delay before the next try, or `None`
    /// once `max_attempts` tries have failed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            None
        } else {
            Some(self.policy.jittered_delay(self.failures))
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Tries made so far, counting the one in progress.
    pub fn attempts(&self) -> u32 {
        self.failures + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn exponential_backoff_increases(#[case] failures: u32, #[case] secs: u64) {
        assert_eq!(no_jitter().next_delay(failures), Duration::from_secs(secs));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..no_jitter()
        };
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(2);
            assert!(d <= Duration::from_secs(4));
            assert!(d >= Duration::from_secs(2));
        }
    }

    #[test]
    fn backoff_gives_up_after_budget() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..no_jitter()
        };
        let mut backoff = policy.backoff(3);
        assert_eq!(backoff.attempts(), 1);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.attempts(), 3);
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.failures(), 3);
    }
}
