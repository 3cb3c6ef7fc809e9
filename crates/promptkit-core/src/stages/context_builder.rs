use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{Message, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;
use crate::tools::patch_dangling_tool_calls;

/// Appends the incoming user message to the context's accumulated history
/// and repairs any dangling tool calls left over from a prior interrupted
/// turn before the provider stage ever sees them.
pub struct ContextBuilderStage;

#[async_trait]
impl Stage for ContextBuilderStage {
    fn name(&self) -> &str {
        "context_builder"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let mut history = ctx.messages().await;
        patch_dangling_tool_calls(&mut history);
        ctx.set_messages(history).await;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            if let StreamElement::Message(message) = &element {
                if matches!(message.role, promptkit_contracts::Role::User) {
                    ctx.push_message(message.clone()).await;
                    ctx.set_user_prompt(message.text()).await;
                }
            }
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Convenience used by the orchestrator to build the single-element input
/// channel a `send`/`send_stream` call starts the pipeline with.
pub fn single_message_input(message: Message, buffer: usize) -> mpsc::Receiver<StreamElement> {
    let (tx, rx) = mpsc::channel(buffer);
    let _ = tx.try_send(StreamElement::Message(message));
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use promptkit_contracts::ToolCall;
    use uuid::Uuid;

    #[tokio::test]
    async fn repairs_dangling_tool_calls_before_forwarding() {
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)));
        ctx.set_messages(vec![Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".into(),
                name: "get_weather".into(),
                arguments: serde_json::json!({}),
            }],
        )])
        .await;

        let stage = ContextBuilderStage;
        let (tx, rx) = mpsc::channel(1);
        tx.send(StreamElement::Message(Message::user("and now?"))).await.unwrap();
        drop(tx);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, ctx.clone()).await.unwrap();
        assert!(out_rx.recv().await.is_some());

        let history = ctx.messages().await;
        assert_eq!(history.len(), 3);
        assert_eq!(ctx.user_prompt().await.as_deref(), Some("and now?"));
    }
}
