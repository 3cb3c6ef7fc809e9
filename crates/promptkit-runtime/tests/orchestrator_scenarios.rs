//! End-to-end orchestrator scenarios exercised against a real tokio runtime
//! rather than the unit-level doubles in `orchestrator.rs`'s own test module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use promptkit_contracts::{Message, Prompt, PromptParameters, StreamElement, ToolDescriptor};
use promptkit_core::event_bus::InMemoryEventBus;
use promptkit_core::memory::{InMemoryMediaStorage, InMemoryStateStore, InProcessToolRegistry, SimpleTemplateRenderer};
use promptkit_core::stages::provider::ToolPolicy;
use promptkit_core::traits::{CallParams, Capability, ElementStream, ProviderAdapter, ProviderResponse};
use promptkit_core::{Error, PipelineDeps};
use promptkit_runtime::{ConversationOrchestrator, OrchestratorConfig};
use uuid::Uuid;

/// Sleeps for a fixed delay before answering, standing in for network latency.
struct SleepyProvider {
    delay: Duration,
}

#[async_trait]
impl ProviderAdapter for SleepyProvider {
    fn provider_id(&self) -> &str {
        "sleepy"
    }

    async fn chat(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> promptkit_core::Result<ProviderResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(ProviderResponse {
            message: Message::assistant("ok"),
            model_id: "sleepy-model".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cached_tokens: 0,
            raw: None,
        })
    }

    async fn chat_stream(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> promptkit_core::Result<ElementStream> {
        tokio::time::sleep(self.delay).await;
        Ok(stream::iter(vec![Ok(StreamElement::TextDelta("ok".to_string()))]).boxed())
    }

    async fn duplex(&self, _input: ElementStream, _params: &CallParams) -> promptkit_core::Result<ElementStream> {
        Err(Error::config("duplex not supported by sleepy provider"))
    }

    fn supports(&self, _capability: Capability) -> bool {
        false
    }
}

fn test_prompt() -> Prompt {
    Prompt {
        id: "p1".to_string(),
        name: "test".to_string(),
        version: "1".to_string(),
        system_template: "you are a test assistant".to_string(),
        variables: vec![],
        parameters: PromptParameters::default(),
        tools: vec![],
    }
}

fn orchestrator_with(delay: Duration, max_concurrent: usize, request_timeout: Duration) -> ConversationOrchestrator {
    let deps = PipelineDeps {
        provider: Arc::new(SleepyProvider { delay }),
        tools: Arc::new(InProcessToolRegistry::default()),
        tool_policy: ToolPolicy::default(),
        state_store: Arc::new(InMemoryStateStore::default()),
        media_storage: Arc::new(InMemoryMediaStorage::default()),
        template_renderer: Arc::new(SimpleTemplateRenderer),
        pre_validators: vec![],
        post_validators: vec![],
        prompt: test_prompt(),
        tool_descriptors: vec![],
    };
    let config = OrchestratorConfig {
        max_concurrent,
        request_timeout,
        shutdown_timeout: Duration::from_secs(10),
        stream_buffer_size: 16,
    };
    ConversationOrchestrator::new(deps, config, Arc::new(InMemoryEventBus::new()))
}

#[tokio::test]
async fn concurrency_ceiling_serializes_the_third_request() {
    let orchestrator = Arc::new(orchestrator_with(Duration::from_millis(500), 2, Duration::from_secs(5)));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move { orchestrator.send(Uuid::now_v7(), None, Message::user("hi")).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let elapsed = start.elapsed();
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(elapsed >= Duration::from_millis(950), "third request should have waited for a slot: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "should not have serialized all three: {elapsed:?}");
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_then_rejects_new_work() {
    let orchestrator = Arc::new(orchestrator_with(Duration::from_secs(2), 4, Duration::from_secs(5)));

    let in_flight = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.send(Uuid::now_v7(), None, Message::user("slow")).await })
    };

    // Give the in-flight send time to acquire its slot before shutdown begins.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown = orchestrator.shutdown(Duration::from_secs(5)).await;
    assert!(shutdown.is_ok());
    assert!(in_flight.await.unwrap().is_ok());

    let rejected = orchestrator.send(Uuid::now_v7(), None, Message::user("too late")).await;
    assert!(matches!(rejected, Err(Error::Shutdown)));
}
