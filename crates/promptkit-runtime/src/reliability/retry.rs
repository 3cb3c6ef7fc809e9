//! Retry policy: exponential backoff with jitter, adapted from the teacher's
//! `durable::reliability::retry` module. Distinct from
//! `promptkit_core::retry::retry_transient`, which is a stage-local helper
//! bounded to a single stage invocation; this policy lives for the lifetime
//! of a `ReliableProvider` and dispatches on `promptkit_core::ErrorKind`
//! rather than a string error-type allowlist, since every error this crate
//! retries already carries one.

use std::time::Duration;

use promptkit_core::ErrorKind;
use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff + jitter, mirroring the teacher's `RetryPolicy`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Jitter factor (0.0-1.0); a value of 0.1 means +/-10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before the given attempt (1-based; attempt 1 is the initial
    /// call and always has zero delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Only `Transient` errors are retried; every other kind means the call
    /// failed in a way a retry can't fix (validation, policy, fatal-provider,
    /// ...).
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_interval: config.initial_interval,
            max_interval: config.max_interval,
            backoff_coefficient: config.backoff_coefficient,
            jitter: config.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_backs_off_exponentially_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(2000));
    }

    #[test]
    fn delay_is_capped_at_max_interval() {
        let policy = RetryPolicy {
            max_interval: Duration::from_millis(800),
            jitter: 0.0,
            ..RetryPolicy::exponential()
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(800));
    }

    #[test]
    fn only_transient_errors_are_retried() {
        let policy = RetryPolicy::exponential();
        assert!(policy.should_retry(ErrorKind::Transient));
        assert!(!policy.should_retry(ErrorKind::Validation));
        assert!(!policy.should_retry(ErrorKind::FatalProvider));
    }

    #[test]
    fn has_attempts_remaining_stops_at_max() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::exponential()
        };
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }
}
