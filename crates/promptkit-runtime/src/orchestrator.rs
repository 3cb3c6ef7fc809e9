//! `ConversationOrchestrator`: the L4 layer from spec.md §4.9, grounded on
//! the teacher's `AgentRunner`/`TemporalRunner` pair (per-run task tracking,
//! cancel signals, `ctrl_c` graceful shutdown) recombined around
//! `promptkit-core`'s pipeline instead of a Temporal workflow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use promptkit_contracts::{event_types, CostInfo, FinishReason, Message, StreamElement};
use promptkit_core::context::ExecutionContext;
use promptkit_core::error::{Error, Result};
use promptkit_core::event_bus::{Event, EventBus, EventListener};
use promptkit_core::stages::context_builder::single_message_input;
use promptkit_core::PipelineDeps;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use uuid::Uuid;

use crate::config::OrchestratorConfig;

/// Everything a single `send`/`send_stream` call produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub response: Option<Message>,
    pub finish_reason: Option<FinishReason>,
    pub cost: CostInfo,
    pub elements: Vec<StreamElement>,
}

enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Owns the collaborators for one pack/prompt combination and serves every
/// conversation built against it: a per-process semaphore throttles total
/// concurrent provider work, a per-conversation mutex serializes successive
/// `send`/`send_stream` calls on the same conversation, and a shutdown flag
/// rejects new work once `shutdown` has been called.
pub struct ConversationOrchestrator {
    deps: Arc<PipelineDeps>,
    config: OrchestratorConfig,
    events: Arc<dyn EventBus>,
    semaphore: Arc<Semaphore>,
    conversation_locks: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    shutting_down: AtomicBool,
}

impl ConversationOrchestrator {
    pub fn new(deps: PipelineDeps, config: OrchestratorConfig, events: Arc<dyn EventBus>) -> Self {
        Self {
            deps: Arc::new(deps),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            events,
            conversation_locks: AsyncMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    async fn conversation_lock(&self, conversation_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks.entry(conversation_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Acquires a concurrency slot, failing fast with `ErrorKind::Shutdown`
    /// once `shutdown` has been called instead of queuing behind it.
    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.semaphore.clone().acquire_owned().await.map_err(|_| Error::Shutdown)
    }

    /// `send(ctx, message) -> run_result`. Blocks until the whole turn
    /// (including every tool round) finishes, fails, is cancelled, or the
    /// per-request timeout elapses.
    pub async fn send(&self, conversation_id: Uuid, user_id: Option<String>, message: Message) -> Result<RunResult> {
        let _permit = self.acquire_slot().await?;
        let conversation_lock = self.conversation_lock(conversation_id).await;
        let _conversation_guard = conversation_lock.lock().await;

        let ctx = Arc::new(ExecutionContext::new(conversation_id, user_id, false, self.events.clone()));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let listener = Arc::new(RunOutcomeSink {
            run_id: ctx.run_id,
            sender: std::sync::Mutex::new(Some(outcome_tx)),
        });
        let subscription = self.events.subscribe_all(listener).await;

        let pipeline = self.deps.build_text_pipeline();
        let input = single_message_input(message, self.config.stream_buffer_size);
        let mut output = pipeline.execute(ctx.clone(), input);

        let mut elements = Vec::new();
        let deadline = tokio::time::sleep(self.config.request_timeout);
        tokio::pin!(deadline);
        let timed_out = loop {
            tokio::select! {
                _ = &mut deadline => {
                    ctx.cancellation.cancel();
                    break true;
                }
                element = output.recv() => {
                    match element {
                        Some(element) => elements.push(element),
                        None => break false,
                    }
                }
            }
        };
        if timed_out {
            while output.recv().await.is_some() {}
        }

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome_rx)
            .await
            .ok()
            .and_then(|r| r.ok());
        subscription.unsubscribe();

        match outcome {
            Some(RunOutcome::Failed(detail)) => Err(Error::Transient {
                stage: "pipeline".to_string(),
                source: anyhow::anyhow!(detail),
            }),
            Some(RunOutcome::Cancelled) | None if timed_out => Err(Error::Cancellation),
            Some(RunOutcome::Cancelled) => Err(Error::Cancellation),
            Some(RunOutcome::Completed) | None => Ok(RunResult {
                run_id: ctx.run_id,
                response: ctx.response().await,
                finish_reason: ctx.finish_reason().await,
                cost: ctx.cost().await,
                elements,
            }),
        }
    }

    /// `send_stream(ctx, message) -> output_channel`. Returns the pipeline's
    /// output directly; a background task forwards elements and releases the
    /// concurrency slot and conversation lock once the channel closes,
    /// normally or via cancellation.
    pub async fn send_stream(
        &self,
        conversation_id: Uuid,
        user_id: Option<String>,
        message: Message,
    ) -> Result<mpsc::Receiver<StreamElement>> {
        let permit = self.acquire_slot().await?;
        let conversation_lock = self.conversation_lock(conversation_id).await;
        let conversation_guard = conversation_lock.lock_owned().await;

        let ctx = Arc::new(ExecutionContext::new(conversation_id, user_id, true, self.events.clone()));
        let pipeline = self.deps.build_text_pipeline();
        let input = single_message_input(message, self.config.stream_buffer_size);
        let mut pipeline_output = pipeline.execute(ctx.clone(), input);

        let (tx, rx) = mpsc::channel(self.config.stream_buffer_size);
        let request_timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let _conversation_guard = conversation_guard;

            let deadline = tokio::time::sleep(request_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        ctx.cancellation.cancel();
                    }
                    element = pipeline_output.recv() => {
                        match element {
                            Some(element) => {
                                if tx.send(element).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    /// `shutdown(timeout) -> error`. Rejects new work immediately, then
    /// waits for every in-flight `send`/`send_stream` to release its slot.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let total = self.config.max_concurrent as u32;

        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_many_owned(total)).await {
            Ok(Ok(_permits)) => Ok(()),
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(Error::ShutdownTimeout),
        }
    }
}

struct RunOutcomeSink {
    run_id: Uuid,
    sender: std::sync::Mutex<Option<oneshot::Sender<RunOutcome>>>,
}

#[async_trait::async_trait]
impl EventListener for RunOutcomeSink {
    async fn on_event(&self, event: &Event) {
        if event.run_id != self.run_id {
            return;
        }

        let outcome = match event.event_type.as_str() {
            event_types::PIPELINE_COMPLETED => Some(RunOutcome::Completed),
            event_types::PIPELINE_FAILED => {
                let detail = event
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("pipeline failed")
                    .to_string();
                Some(RunOutcome::Failed(detail))
            }
            event_types::PIPELINE_CANCELLED => Some(RunOutcome::Cancelled),
            _ => None,
        };

        if let Some(outcome) = outcome {
            if let Some(sender) = self.sender.lock().unwrap().take() {
                let _ = sender.send(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptkit_core::event_bus::InMemoryEventBus;
    use promptkit_core::memory::{InMemoryMediaStorage, InMemoryStateStore, InProcessToolRegistry, SimpleTemplateRenderer};
    use promptkit_core::stages::provider::ToolPolicy;
    use promptkit_core::traits::{CallParams, Capability, ElementStream, ProviderAdapter, ProviderResponse};
    use promptkit_contracts::{Prompt, PromptParameters, ToolDescriptor};

    struct EchoProvider;

    #[async_trait::async_trait]
    impl ProviderAdapter for EchoProvider {
        fn provider_id(&self) -> &str {
            "echo"
        }

        async fn chat(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> Result<ProviderResponse> {
            Ok(ProviderResponse {
                message: Message::assistant("hello"),
                model_id: "echo-model".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cached_tokens: 0,
                raw: None,
            })
        }

        async fn chat_stream(&self, _messages: &[Message], _tools: &[ToolDescriptor], _params: &CallParams) -> Result<ElementStream> {
            use futures_util::stream::{self, StreamExt};
            Ok(stream::iter(vec![Ok(StreamElement::TextDelta("hello".to_string()))]).boxed())
        }

        async fn duplex(&self, _input: ElementStream, _params: &CallParams) -> Result<ElementStream> {
            Err(Error::config("duplex not supported by echo provider"))
        }

        fn supports(&self, capability: Capability) -> bool {
            matches!(capability, Capability::Tools)
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

    fn orchestrator(max_concurrent: usize) -> ConversationOrchestrator {
        let deps = PipelineDeps {
            provider: Arc::new(EchoProvider),
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
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            stream_buffer_size: 16,
        };
        ConversationOrchestrator::new(deps, config, Arc::new(InMemoryEventBus::new()))
    }

    #[tokio::test]
    async fn send_returns_the_provider_response() {
        let orchestrator = orchestrator(4);
        let result = orchestrator
            .send(Uuid::now_v7(), None, Message::user("hi"))
            .await
            .unwrap();

        assert_eq!(result.response.as_ref().and_then(|m| m.content.clone()), Some("hello".to_string()));
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sends() {
        let orchestrator = orchestrator(4);
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();

        let result = orchestrator.send(Uuid::now_v7(), None, Message::user("hi")).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn same_conversation_sends_are_serialized() {
        let orchestrator = Arc::new(orchestrator(4));
        let conversation_id = Uuid::now_v7();

        let a = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send(conversation_id, None, Message::user("first")).await })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send(conversation_id, None, Message::user("second")).await })
        };

        let (first, second) = tokio::join!(a, b);
        assert!(first.unwrap().is_ok());
        assert!(second.unwrap().is_ok());
    }
}
