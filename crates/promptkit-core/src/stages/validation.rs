use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{event_types, FinishReason, Role, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event_bus::Event;
use crate::stage::Stage;
use crate::traits::{ValidationOutcome, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Pre,
    Post,
}

impl ValidationPhase {
    fn label(self) -> &'static str {
        match self {
            ValidationPhase::Pre => "pre",
            ValidationPhase::Post => "post",
        }
    }

    fn message_role(self) -> Role {
        match self {
            ValidationPhase::Pre => Role::User,
            ValidationPhase::Post => Role::Assistant,
        }
    }
}

/// Runs registered validators in order (fast ones first, by convention of the
/// caller-supplied ordering) against either a full message (batch mode) or
/// each text delta as it streams through (streaming mode, for validators that
/// opt in). A batch failure sets `short_circuit`; a streaming failure sets
/// `interrupt` and this stage itself emits the `finish(interrupted)` element,
/// since it is the first place downstream of the provider able to swallow
/// the offending delta before it reaches the caller.
pub struct ValidationStage {
    validators: Vec<Arc<dyn Validator>>,
    phase: ValidationPhase,
}

impl ValidationStage {
    pub fn new(validators: Vec<Arc<dyn Validator>>, phase: ValidationPhase) -> Self {
        Self { validators, phase }
    }

    async fn run_batch(&self, ctx: &ExecutionContext, text: &str) -> Option<(String, String)> {
        for validator in &self.validators {
            match validator.validate_batch(text).await {
                Ok(ValidationOutcome::Passed) => {
                    ctx.events
                        .publish(Event::new(
                            event_types::VALIDATION_PASSED,
                            ctx.run_id,
                            ctx.conversation_id,
                            serde_json::json!({ "validator": validator.name() }),
                        ))
                        .await;
                }
                Ok(ValidationOutcome::Failed { detail }) => {
                    return Some((validator.name().to_string(), detail));
                }
                Err(err) => return Some((validator.name().to_string(), err.to_string())),
            }
        }
        None
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &str {
        match self.phase {
            ValidationPhase::Pre => "validation_pre",
            ValidationPhase::Post => "validation_post",
        }
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let streaming_validators: Vec<_> = self
            .validators
            .iter()
            .filter(|v| v.is_streaming_capable())
            .cloned()
            .collect();
        let mut accumulated = String::new();
        let mut interrupted = false;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }

            if interrupted {
                // Already told the caller we're done; keep draining silently
                // so upstream doesn't block on a full channel.
                continue;
            }

            match &element {
                StreamElement::TextDelta(delta) if !streaming_validators.is_empty() => {
                    accumulated.push_str(delta);
                    let mut violated = None;
                    for validator in &streaming_validators {
                        match validator.validate_delta(&accumulated).await {
                            Ok(ValidationOutcome::Passed) => {}
                            Ok(ValidationOutcome::Failed { detail }) => {
                                violated = Some((validator.name().to_string(), detail));
                                break;
                            }
                            Err(err) => {
                                violated = Some((validator.name().to_string(), err.to_string()));
                                break;
                            }
                        }
                    }
                    if let Some((validator, detail)) = violated {
                        ctx.set_interrupt(detail.clone());
                        ctx.events
                            .publish(Event::new(
                                event_types::VALIDATION_FAILED,
                                ctx.run_id,
                                ctx.conversation_id,
                                serde_json::json!({ "validator": validator, "detail": detail, "kind": self.phase.label() }),
                            ))
                            .await;
                        if output
                            .send(StreamElement::Finish(FinishReason::Interrupted))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        interrupted = true;
                        continue;
                    }
                    if output.send(element).await.is_err() {
                        break;
                    }
                }
                StreamElement::Message(message) if message.role == self.phase.message_role() => {
                    if let Some((validator, detail)) = self.run_batch(&ctx, &message.text()).await {
                        ctx.set_short_circuit();
                        ctx.events
                            .publish(Event::new(
                                event_types::VALIDATION_FAILED,
                                ctx.run_id,
                                ctx.conversation_id,
                                serde_json::json!({ "validator": validator, "detail": detail, "kind": self.phase.label() }),
                            ))
                            .await;
                        // Swallow the offending message; nothing more to do
                        // downstream of a pre-validator rejection.
                        continue;
                    }
                    if output.send(element).await.is_err() {
                        break;
                    }
                }
                _ => {
                    if output.send(element).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use async_trait::async_trait;
    use promptkit_contracts::Message;
    use uuid::Uuid;

    struct BannedWords {
        banned: Vec<String>,
        streaming: bool,
    }

    #[async_trait]
    impl Validator for BannedWords {
        fn name(&self) -> &str {
            "banned_words"
        }

        fn is_streaming_capable(&self) -> bool {
            self.streaming
        }

        async fn validate_batch(&self, text: &str) -> Result<ValidationOutcome> {
            for word in &self.banned {
                if text.contains(word.as_str()) {
                    return Ok(ValidationOutcome::Failed {
                        detail: format!("contains banned word '{word}'"),
                    });
                }
            }
            Ok(ValidationOutcome::Passed)
        }
    }

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)))
    }

    #[tokio::test]
    async fn streaming_violation_interrupts_and_swallows_remaining_deltas() {
        let stage = ValidationStage::new(
            vec![Arc::new(BannedWords {
                banned: vec!["spam".into()],
                streaming: true,
            })],
            ValidationPhase::Post,
        );
        let c = ctx();
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamElement::text_delta("The answer is ")).await.unwrap();
        tx.send(StreamElement::text_delta("spam")).await.unwrap();
        tx.send(StreamElement::text_delta(".")).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        stage.process(rx, out_tx, c.clone()).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        matches!(first, StreamElement::TextDelta(t) if t == "The answer is ");
        let second = out_rx.recv().await.unwrap();
        assert!(matches!(second, StreamElement::Finish(FinishReason::Interrupted)));
        assert!(out_rx.recv().await.is_none());
        assert!(c.is_interrupted());
    }

    #[tokio::test]
    async fn pre_validation_short_circuits_on_batch_failure() {
        let stage = ValidationStage::new(
            vec![Arc::new(BannedWords {
                banned: vec!["spam".into()],
                streaming: false,
            })],
            ValidationPhase::Pre,
        );
        let c = ctx();
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamElement::Message(Message::user("buy spam now")))
            .await
            .unwrap();
        drop(tx);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        stage.process(rx, out_tx, c.clone()).await.unwrap();
        assert!(out_rx.recv().await.is_none());
        assert!(c.is_short_circuited());
    }
}
