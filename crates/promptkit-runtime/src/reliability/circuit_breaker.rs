//! In-process circuit breaker, adapted from the teacher's
//! `durable::reliability::{circuit_breaker, distributed_circuit_breaker}`:
//! the config/state enum is carried over unchanged, the state machine and
//! `CircuitBreakerPermit` consuming-success/failure pattern come from
//! `DistributedCircuitBreaker`, simplified to a single in-memory
//! `tokio::sync::RwLock` since nothing in this workspace runs the
//! orchestrator across more than one process.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all calls allowed.
    Closed,
    /// Failure threshold exceeded, all calls rejected until `reset_timeout`.
    Open,
    /// Testing if the provider recovered; one side's worth of calls allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            reset_timeout: settings.reset_timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker is open")]
    Open,
}

struct State {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Guards a single collaborator (here, a `ProviderAdapter`) behind a
/// closed/open/half-open state machine. `allow()` must be paired with
/// exactly one of the returned permit's `success()`/`failure()`.
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    state: RwLock<State>,
}

pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub async fn success(self) {
        self.breaker.record_success().await;
    }

    pub async fn failure(self) {
        self.breaker.record_failure().await;
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: RwLock::new(State {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn current_state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn allow(&self) -> Result<CircuitBreakerPermit<'_>, CircuitBreakerError> {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    tracing::info!(key = %self.key, "circuit breaker half-opening after reset timeout");
                } else {
                    return Err(CircuitBreakerError::Open);
                }
            }
        }
        drop(state);
        Ok(CircuitBreakerPermit { breaker: self })
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(key = %self.key, "circuit breaker closing after recovery");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(key = %self.key, failures = state.failure_count, "circuit breaker opening");
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(key = %self.key, "circuit breaker reopening after half-open failure");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                reset_timeout: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = breaker(2);
        cb.allow().await.unwrap().failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Closed);
        cb.allow().await.unwrap().failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Open);
        assert!(matches!(cb.allow().await, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn half_opens_after_reset_timeout_then_closes_on_success() {
        let cb = breaker(1);
        cb.allow().await.unwrap().failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let permit = cb.allow().await.expect("half-open should allow a probe");
        assert_eq!(cb.current_state().await, CircuitState::HalfOpen);
        permit.success().await;
        cb.allow().await.unwrap().success().await;
        assert_eq!(cb.current_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_the_circuit() {
        let cb = breaker(1);
        cb.allow().await.unwrap().failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cb.allow().await.unwrap().failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let cb = breaker(2);
        cb.allow().await.unwrap().failure().await;
        cb.allow().await.unwrap().success().await;
        cb.allow().await.unwrap().failure().await;
        assert_eq!(cb.current_state().await, CircuitState::Closed);
    }
}
