use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use promptkit_contracts::{
    event_types, CostInfo, FinishReason, Message, StreamElement, ToolCall, ToolResult,
};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::event_bus::Event;
use crate::stage::Stage;
use crate::traits::{CallParams, ProviderAdapter, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
}

/// Per-conversation tool-calling configuration, enforced before dispatch on
/// every round. A violation aborts the turn as a `tool_policy` validation
/// failure rather than silently dropping calls.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    pub tool_choice: ToolChoice,
    pub max_tool_calls_per_turn: usize,
    pub max_total_tool_calls: Option<usize>,
    pub blocklist: HashSet<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            tool_choice: ToolChoice::Auto,
            max_tool_calls_per_turn: 8,
            max_total_tool_calls: None,
            blocklist: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    NonStreaming,
    StreamingText,
    NativeDuplex,
}

const DEFAULT_MAX_ROUNDS: u32 = 10;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProviderCallStage {
    provider: Arc<dyn ProviderAdapter>,
    tools: Arc<dyn ToolRegistry>,
    policy: ToolPolicy,
    mode: ProviderMode,
    params: CallParams,
    max_rounds: u32,
}

impl ProviderCallStage {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        tools: Arc<dyn ToolRegistry>,
        policy: ToolPolicy,
        mode: ProviderMode,
        params: CallParams,
    ) -> Self {
        Self {
            provider,
            tools,
            policy,
            mode,
            params,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    fn assembled_messages(&self, ctx_messages: Vec<Message>, system_prompt: Option<String>) -> Vec<Message> {
        let mut messages = Vec::with_capacity(ctx_messages.len() + 1);
        if let Some(system) = system_prompt {
            messages.push(Message::system(system));
        }
        messages.extend(ctx_messages);
        messages
    }

    async fn enforce_policy(&self, ctx: &ExecutionContext, calls: &[ToolCall]) -> Result<()> {
        if calls.is_empty() {
            return Ok(());
        }
        if self.policy.tool_choice == ToolChoice::None {
            return Err(Error::tool_policy("tool calls are disabled for this conversation"));
        }
        if calls.len() > self.policy.max_tool_calls_per_turn {
            return Err(Error::tool_policy(format!(
                "{} tool calls exceeds max_tool_calls_per_turn ({})",
                calls.len(),
                self.policy.max_tool_calls_per_turn
            )));
        }
        for call in calls {
            if self.policy.blocklist.contains(&call.name) {
                return Err(Error::tool_policy(format!("tool '{}' is blocklisted", call.name)));
            }
            if !ctx.is_tool_allowed(&call.name).await {
                return Err(Error::tool_policy(format!(
                    "tool '{}' is not in the conversation's allowed set",
                    call.name
                )));
            }
        }
        if let Some(max_total) = self.policy.max_total_tool_calls {
            let already = ctx
                .messages()
                .await
                .iter()
                .filter(|m| m.tool_result.is_some())
                .count();
            if already + calls.len() > max_total {
                return Err(Error::tool_policy("max_total_tool_calls exceeded"));
            }
        }
        Ok(())
    }

    /// Dispatches every call in `calls` in parallel, then reorders results
    /// back into the original call order before returning them.
    async fn dispatch_round(&self, ctx: &ExecutionContext, calls: Vec<ToolCall>) -> Vec<(ToolCall, crate::tools::ToolExecutionResult)> {
        let call_futures = calls.into_iter().map(|call| {
            let ctx_events = ctx.events.clone();
            let run_id = ctx.run_id;
            let conversation_id = ctx.conversation_id;
            let tools = self.tools.clone();
            async move {
                ctx_events
                    .publish(Event::new(
                        event_types::TOOL_CALL_STARTED,
                        run_id,
                        conversation_id,
                        serde_json::json!({ "call_id": call.id, "name": call.name }),
                    ))
                    .await;
                let started = std::time::Instant::now();

                let result = match tools.get(&call.name) {
                    None => crate::tools::ToolExecutionResult::InternalError(
                        crate::tools::ToolInternalError::new(format!("unknown tool '{}'", call.name)),
                    ),
                    Some(descriptor) => {
                        let timeout = if descriptor.timeout.is_zero() {
                            DEFAULT_TOOL_TIMEOUT
                        } else {
                            descriptor.timeout
                        };
                        match tokio::time::timeout(timeout, tools.execute(&descriptor, call.arguments.clone())).await {
                            Ok(result) => result,
                            Err(_) => crate::tools::ToolExecutionResult::ToolError("tool call timed out".into()),
                        }
                    }
                };

                let status = match &result {
                    crate::tools::ToolExecutionResult::Success(_) => "complete",
                    crate::tools::ToolExecutionResult::ToolError(_) => "failed",
                    crate::tools::ToolExecutionResult::InternalError(_) => "failed",
                    crate::tools::ToolExecutionResult::Pending(_) => "pending",
                };
                if status == "failed" {
                    ctx_events
                        .publish(Event::new(
                            event_types::TOOL_CALL_FAILED,
                            run_id,
                            conversation_id,
                            serde_json::json!({ "call_id": call.id, "name": call.name, "error": status }),
                        ))
                        .await;
                }
                ctx_events
                    .publish(Event::new(
                        event_types::TOOL_CALL_COMPLETED,
                        run_id,
                        conversation_id,
                        serde_json::json!({
                            "call_id": call.id,
                            "name": call.name,
                            "duration_ms": started.elapsed().as_millis() as u64,
                            "status": status,
                        }),
                    ))
                    .await;
                (call, result)
            }
        });
        futures::future::join_all(call_futures).await
    }

    async fn run_non_streaming(&self, ctx: &ExecutionContext) -> Result<()> {
        for round in 0..self.max_rounds {
            let messages = self.assembled_messages(ctx.messages().await, ctx.system_prompt().await);
            let tool_defs = ctx.tool_defs().await;

            ctx.events
                .publish(Event::new(
                    event_types::PROVIDER_CALL_STARTED,
                    ctx.run_id,
                    ctx.conversation_id,
                    serde_json::json!({ "provider_id": self.provider.provider_id(), "model_id": "", "round": round }),
                ))
                .await;

            let response = self.provider.chat(&messages, &tool_defs, &self.params).await?;
            ctx.add_cost(CostInfo::new(
                response.input_tokens,
                response.output_tokens,
                response.cached_tokens,
                0.0,
            ))
            .await;
            if let Some(raw) = &response.raw {
                ctx.set_raw_response(raw.clone()).await;
            }

            let finish_reason_label = if response.message.tool_calls.is_empty() {
                "stop"
            } else {
                "tool_calls"
            };
            ctx.events
                .publish(Event::new(
                    event_types::PROVIDER_CALL_COMPLETED,
                    ctx.run_id,
                    ctx.conversation_id,
                    serde_json::json!({
                        "provider_id": self.provider.provider_id(),
                        "model_id": response.model_id,
                        "round": round,
                        "input_tokens": response.input_tokens,
                        "output_tokens": response.output_tokens,
                        "finish_reason": finish_reason_label,
                    }),
                ))
                .await;

            let tool_calls = response.message.tool_calls.clone();
            ctx.push_message(response.message.clone()).await;

            if tool_calls.is_empty() {
                ctx.set_response(response.message).await;
                ctx.set_finish_reason(FinishReason::Stop).await;
                return Ok(());
            }

            self.enforce_policy(ctx, &tool_calls).await?;
            for call in &tool_calls {
                ctx.track_pending_call(call.clone()).await;
            }

            let dispatched = self.dispatch_round(ctx, tool_calls.clone()).await;
            let mut by_id: HashMap<String, crate::tools::ToolExecutionResult> =
                dispatched.into_iter().map(|(call, result)| (call.id, result)).collect();

            let mut pending_ids = Vec::new();
            for call in &tool_calls {
                if let Some(crate::tools::ToolExecutionResult::Pending(_)) = by_id.get(&call.id) {
                    pending_ids.push(call.id.clone());
                } else {
                    ctx.resolve_pending_call(&call.id).await;
                }
            }

            // Reorder back into original call order before appending.
            for call in &tool_calls {
                let result = by_id.remove(&call.id).expect("every dispatched call has a result");
                let tool_result: ToolResult = result.into_tool_result(call.id.clone());
                ctx.record_tool_result(tool_result.clone()).await;
                ctx.push_message(Message::tool_result(tool_result)).await;
            }

            if !pending_ids.is_empty() {
                ctx.set_finish_reason(FinishReason::Pending { call_ids: pending_ids }).await;
                return Ok(());
            }
        }
        Err(Error::ToolLoopExceeded { max_rounds: self.max_rounds })
    }

    async fn run_streaming_text(
        &self,
        ctx: &ExecutionContext,
        output: &mpsc::Sender<StreamElement>,
    ) -> Result<()> {
        for round in 0..self.max_rounds {
            let messages = self.assembled_messages(ctx.messages().await, ctx.system_prompt().await);
            let tool_defs = ctx.tool_defs().await;

            ctx.events
                .publish(Event::new(
                    event_types::PROVIDER_CALL_STARTED,
                    ctx.run_id,
                    ctx.conversation_id,
                    serde_json::json!({ "provider_id": self.provider.provider_id(), "model_id": "", "round": round }),
                ))
                .await;

            let mut stream = self.provider.chat_stream(&messages, &tool_defs, &self.params).await?;
            let mut text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut interrupted = false;

            while let Some(element) = stream.next().await {
                if ctx.cancellation.is_cancelled() {
                    return Err(Error::Cancellation);
                }
                if ctx.is_interrupted() {
                    interrupted = true;
                    break;
                }
                match element? {
                    StreamElement::TextDelta(delta) => {
                        text.push_str(&delta);
                        if output.send(StreamElement::TextDelta(delta)).await.is_err() {
                            return Ok(());
                        }
                    }
                    StreamElement::ToolCall(call) => tool_calls.push(call),
                    StreamElement::Metadata(_) => {}
                    other => {
                        if output.send(other).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if interrupted {
                let _ = output.send(StreamElement::Finish(FinishReason::Interrupted)).await;
                ctx.set_finish_reason(FinishReason::Interrupted).await;
                return Ok(());
            }

            let message = if tool_calls.is_empty() {
                Message::assistant(text.clone())
            } else {
                Message::assistant_with_tool_calls(
                    if text.is_empty() { None } else { Some(text.clone()) },
                    tool_calls.clone(),
                )
            };
            ctx.push_message(message.clone()).await;

            if tool_calls.is_empty() {
                if output.send(StreamElement::Finish(FinishReason::Stop)).await.is_err() {
                    return Ok(());
                }
                ctx.set_response(message).await;
                ctx.set_finish_reason(FinishReason::Stop).await;
                return Ok(());
            }

            self.enforce_policy(ctx, &tool_calls).await?;
            for call in &tool_calls {
                ctx.track_pending_call(call.clone()).await;
            }
            let dispatched = self.dispatch_round(ctx, tool_calls.clone()).await;
            let mut by_id: HashMap<String, crate::tools::ToolExecutionResult> =
                dispatched.into_iter().map(|(call, result)| (call.id, result)).collect();

            let mut pending_ids = Vec::new();
            for call in &tool_calls {
                if let Some(crate::tools::ToolExecutionResult::Pending(_)) = by_id.get(&call.id) {
                    pending_ids.push(call.id.clone());
                } else {
                    ctx.resolve_pending_call(&call.id).await;
                }
            }
            for call in &tool_calls {
                let result = by_id.remove(&call.id).expect("every dispatched call has a result");
                let tool_result: ToolResult = result.into_tool_result(call.id.clone());
                let _ = output.send(StreamElement::ToolResult(tool_result.clone())).await;
                ctx.record_tool_result(tool_result.clone()).await;
                ctx.push_message(Message::tool_result(tool_result)).await;
            }

            if !pending_ids.is_empty() {
                ctx.set_finish_reason(FinishReason::Pending { call_ids: pending_ids }).await;
                return Ok(());
            }
        }
        Err(Error::ToolLoopExceeded { max_rounds: self.max_rounds })
    }

    async fn run_native_duplex(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let (in_tx, in_rx) = mpsc::channel(crate::stage::DEFAULT_AUDIO_BUFFER);
        let forward = tokio::spawn(async move {
            while let Some(element) = input.recv().await {
                if in_tx.send(Ok(element)).await.is_err() {
                    break;
                }
            }
        });
        let in_stream = tokio_stream::wrappers::ReceiverStream::new(in_rx).boxed();
        let mut out_stream = self.provider.duplex(in_stream, &self.params).await?;
        while let Some(element) = out_stream.next().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            if output.send(element?).await.is_err() {
                break;
            }
        }
        let _ = forward.await;
        Ok(())
    }
}

#[async_trait]
impl Stage for ProviderCallStage {
    fn name(&self) -> &str {
        match self.mode {
            ProviderMode::NonStreaming => "provider_call_non_streaming",
            ProviderMode::StreamingText => "provider_call_streaming",
            ProviderMode::NativeDuplex => "provider_call_duplex",
        }
    }

    async fn process(
        &self,
        input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        match self.mode {
            ProviderMode::NonStreaming => {
                drain_silently(input).await;
                self.run_non_streaming(&ctx).await
            }
            ProviderMode::StreamingText => {
                drain_silently(input).await;
                self.run_streaming_text(&ctx, &output).await
            }
            ProviderMode::NativeDuplex => self.run_native_duplex(input, output, &ctx).await,
        }
    }
}

/// The provider stage is the pipeline's message source for text/VAD modes:
/// upstream stages only ever forward the already-recorded `Message` the
/// context-builder appended, so there is nothing further to relay once the
/// provider has its assembled context. Duplex mode is the exception (audio
/// flows continuously) and has its own loop above.
async fn drain_silently(mut input: mpsc::Receiver<StreamElement>) {
    while input.recv().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use crate::memory::InProcessToolRegistry;
    use crate::traits::Capability;
    use promptkit_contracts::ToolDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct MockProvider {
        round: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn provider_id(&self) -> &str {
            "mock"
        }

        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDescriptor],
            _params: &CallParams,
        ) -> Result<crate::traits::ProviderResponse> {
            let round = self.round.fetch_add(1, Ordering::SeqCst);
            let message = if round == 0 {
                Message::assistant_with_tool_calls(
                    None,
                    vec![ToolCall {
                        id: "call_1".into(),
                        name: "get_weather".into(),
                        arguments: serde_json::json!({ "city": "Paris" }),
                    }],
                )
            } else {
                Message::assistant("it's sunny")
            };
            Ok(crate::traits::ProviderResponse {
                message,
                model_id: "mock-model".into(),
                input_tokens: 10,
                output_tokens: 5,
                cached_tokens: 0,
                raw: None,
            })
        }

        async fn chat_stream(
            &self,
            _messages: &[Message],
            _tools: &[ToolDescriptor],
            _params: &CallParams,
        ) -> Result<crate::traits::ElementStream> {
            Err(Error::config("streaming not supported by mock"))
        }

        async fn duplex(
            &self,
            _input: crate::traits::ElementStream,
            _params: &CallParams,
        ) -> Result<crate::traits::ElementStream> {
            Err(Error::config("duplex not supported by mock"))
        }

        fn supports(&self, capability: Capability) -> bool {
            matches!(capability, Capability::Tools)
        }
    }

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)))
    }

    fn weather_tool() -> ToolDescriptor {
        ToolDescriptor {
            name: "get_weather".into(),
            description: "looks up the weather".into(),
            input_schema: serde_json::json!({}),
            output_schema: None,
            mode: promptkit_contracts::ExecutionMode::InProcessHandler {
                handler_key: "get_weather".into(),
            },
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn dispatches_tool_call_then_completes_on_next_round() {
        let mut registry = InProcessToolRegistry::default();
        registry.register(weather_tool(), |_args| {
            crate::tools::ToolExecutionResult::Success(serde_json::json!({ "temp_c": 22 }))
        });

        let stage = ProviderCallStage::new(
            Arc::new(MockProvider { round: AtomicU32::new(0) }),
            Arc::new(registry),
            ToolPolicy::default(),
            ProviderMode::NonStreaming,
            CallParams::default(),
        );
        let c = ctx();
        c.push_message(Message::user("what's the weather in Paris?")).await;

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (out_tx, _out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, c.clone()).await.unwrap();

        assert_eq!(c.finish_reason().await, Some(FinishReason::Stop));
        assert_eq!(c.response().await.unwrap().text(), "it's sunny");
        let history = c.messages().await;
        assert!(history.iter().any(|m| m.tool_result.is_some()));
        assert!(c.pending_call_ids().await.is_empty());
        let cost = c.cost().await;
        assert_eq!(cost.input_tokens, 20);
    }

    #[tokio::test]
    async fn blocklisted_tool_triggers_tool_policy_error() {
        let registry = InProcessToolRegistry::default();
        let policy = ToolPolicy {
            blocklist: ["get_weather".to_string()].into_iter().collect(),
            ..ToolPolicy::default()
        };
        let stage = ProviderCallStage::new(
            Arc::new(MockProvider { round: AtomicU32::new(0) }),
            Arc::new(registry),
            policy,
            ProviderMode::NonStreaming,
            CallParams::default(),
        );
        let c = ctx();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let result = stage.process(rx, out_tx, c.clone()).await;
        assert!(matches!(result, Err(Error::ToolPolicy { .. })));
    }
}
