//! Reliability primitives layered on top of a `ProviderAdapter`, adapted
//! from the teacher's `durable::reliability` module. `promptkit_core::retry`
//! already retries a single stage invocation (state-store load); this module
//! composes retry with a circuit breaker at the collaborator level, where
//! state persists *across* calls, per that module's own forward reference.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{Message, ToolDescriptor};
use promptkit_core::error::{Error, Result};
use promptkit_core::traits::{CallParams, Capability, ElementStream, ProviderAdapter, ProviderResponse};

/// Wraps a `ProviderAdapter` with retry (for `chat`/`chat_stream` setup
/// failures) and a circuit breaker (fail fast once the provider looks
/// consistently down). Per-element failures inside an already-established
/// stream aren't retried here — only `ProviderCallStage`'s own round loop
/// sees those, same as with an unwrapped provider. `duplex` takes its input
/// stream by value, so it can't be replayed on retry; it's guarded by the
/// circuit breaker only.
pub struct ReliableProvider {
    inner: Arc<dyn ProviderAdapter>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ReliableProvider {
    pub fn new(inner: Arc<dyn ProviderAdapter>, retry: RetryPolicy, breaker_config: CircuitBreakerConfig) -> Self {
        let key = inner.provider_id().to_string();
        Self {
            inner,
            retry,
            breaker: CircuitBreaker::new(key, breaker_config),
        }
    }

    fn open_error(&self) -> Error {
        Error::FatalProvider {
            provider_id: self.inner.provider_id().to_string(),
            detail: "circuit breaker open".to_string(),
        }
    }

    async fn call_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.breaker.allow().await.map_err(|_| self.open_error())?;

        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    permit.success().await;
                    return Ok(value);
                }
                Err(err) => {
                    let kind = err.kind();
                    if self.retry.should_retry(kind) && self.retry.has_attempts_remaining(attempt) {
                        let delay = self.retry.delay_for_attempt(attempt + 1);
                        tracing::warn!(
                            provider = self.inner.provider_id(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying transient provider error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    permit.failure().await;
                    return Err(err);
                }
            }
        }
    }

    async fn call_once<T, Fut>(&self, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.breaker.allow().await.map_err(|_| self.open_error())?;
        match op.await {
            Ok(value) => {
                permit.success().await;
                Ok(value)
            }
            Err(err) => {
                permit.failure().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for ReliableProvider {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ProviderResponse> {
        self.call_with_retry(|| async { self.inner.chat(messages, tools, params).await }).await
    }

    async fn chat_stream(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ElementStream> {
        self.call_with_retry(|| async { self.inner.chat_stream(messages, tools, params).await })
            .await
    }

    async fn duplex(&self, input: ElementStream, params: &CallParams) -> Result<ElementStream> {
        self.call_once(self.inner.duplex(input, params)).await
    }

    fn supports(&self, capability: Capability) -> bool {
        self.inner.supports(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use promptkit_core::traits::ProviderResponse;

    struct FlakyProvider {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyProvider {
        fn provider_id(&self) -> &str {
            "flaky"
        }

        async fn chat(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> Result<ProviderResponse> {
            if self.failures_remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(Error::transient("flaky", anyhow::anyhow!("temporary")));
            }
            Ok(ProviderResponse {
                message: Message::assistant("ok"),
                model_id: "flaky-model".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cached_tokens: 0,
                raw: None,
            })
        }

        async fn chat_stream(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> Result<ElementStream> {
            unimplemented!()
        }

        async fn duplex(&self, _input: ElementStream, _params: &CallParams) -> Result<ElementStream> {
            unimplemented!()
        }

        fn supports(&self, _capability: Capability) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let inner = Arc::new(FlakyProvider {
            failures_remaining: AtomicU32::new(2),
        });
        let reliable = ReliableProvider::new(
            inner,
            RetryPolicy {
                jitter: 0.0,
                initial_interval: Duration::from_millis(1),
                ..RetryPolicy::exponential()
            },
            CircuitBreakerConfig::default(),
        );

        let result = reliable.chat(&[], &[], &CallParams::default()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn circuit_opens_after_exhausting_retries_repeatedly() {
        let inner = Arc::new(FlakyProvider {
            failures_remaining: AtomicU32::new(u32::MAX),
        });
        let reliable = ReliableProvider::new(
            inner,
            RetryPolicy {
                max_attempts: 1,
                jitter: 0.0,
                ..RetryPolicy::exponential()
            },
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(30),
            },
        );

        assert!(reliable.chat(&[], &[], &CallParams::default()).await.is_err());
        assert!(reliable.chat(&[], &[], &CallParams::default()).await.is_err());

        let third = reliable.chat(&[], &[], &CallParams::default()).await;
        assert!(matches!(third, Err(Error::FatalProvider { .. })));
    }
}
