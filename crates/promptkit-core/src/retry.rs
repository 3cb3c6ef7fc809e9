//! A small per-stage retry helper for the handful of stages that retry
//! transient errors inline (state-store load, provider call). The richer
//! `promptkit_runtime::reliability` module layers a circuit breaker on top of
//! this same idea at the orchestrator level, where state persists *across*
//! calls rather than within a single stage invocation.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffConfig {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.min(10));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Retries `op` up to `config.max_attempts` times, but only while the error
/// it returns has `ErrorKind::Transient`. Any other kind returns immediately.
pub async fn retry_transient<T, F, Fut>(config: BackoffConfig, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ErrorKind::Transient && attempt + 1 < config.max_attempts => {
                tokio::time::sleep(config.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let config = BackoffConfig::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let result = retry_transient(config, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::transient("state_store", anyhow::anyhow!("timeout")))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient() {
        let attempts = AtomicU32::new(0);
        let config = BackoffConfig::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let result: Result<(), Error> = retry_transient(config, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("banned_words", "blocked"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
