use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::StreamElement;
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event_bus::Event;
use promptkit_contracts::event_types;

/// Default bounded-channel capacity between stages carrying text elements.
pub const DEFAULT_TEXT_BUFFER: usize = 64;
/// Default bounded-channel capacity between stages carrying audio elements.
pub const DEFAULT_AUDIO_BUFFER: usize = 100;

/// A unit of stream processing. `process` is long-running: it reads from
/// `input` until the channel closes or `ctx.cancellation` fires, transforms
/// or forwards elements to `output`, and must close `output` (by returning,
/// which drops the sender) before returning.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()>;
}

/// Builds a linear chain of stages. DAG shapes (fan-out/fan-in) are achieved
/// by inserting the `Router`/`Merge` plumbing stages from
/// `crate::stages::plumbing` into the chain — the builder itself only ever
/// wires one stage's output to the next one's input.
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    buffer: usize,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            buffer: DEFAULT_TEXT_BUFFER,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn chain(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            buffer: self.buffer,
        }
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    buffer: usize,
}

impl Pipeline {
    /// Spawns one task per stage, wires channels head-to-tail, and returns
    /// the final output channel immediately. The caller drains it until
    /// closure. `pipeline.started`/`completed`/`failed`/`cancelled` are
    /// published on `ctx.events`.
    pub fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        input: mpsc::Receiver<StreamElement>,
    ) -> mpsc::Receiver<StreamElement> {
        let run_id = ctx.run_id;
        let conversation_id = ctx.conversation_id;

        {
            let events = ctx.events.clone();
            tokio::spawn(async move {
                events
                    .publish(Event::new(
                        event_types::PIPELINE_STARTED,
                        run_id,
                        conversation_id,
                        serde_json::json!({ "run_id": run_id }),
                    ))
                    .await;
            });
        }

        let mut current_rx = input;
        let mut join_handles = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let (tx, rx) = mpsc::channel(self.buffer);
            let stage = stage.clone();
            let ctx = ctx.clone();
            let stage_name = stage.name().to_string();
            let prev_rx = std::mem::replace(&mut current_rx, rx);

            let handle = tokio::spawn(async move {
                let started_at = std::time::Instant::now();
                ctx.events
                    .publish(Event::new(
                        event_types::STAGE_STARTED,
                        ctx.run_id,
                        ctx.conversation_id,
                        serde_json::json!({ "name": stage_name, "type": stage_name }),
                    ))
                    .await;

                let result = stage.process(prev_rx, tx, ctx.clone()).await;

                match &result {
                    Ok(()) => {
                        ctx.events
                            .publish(Event::new(
                                event_types::STAGE_COMPLETED,
                                ctx.run_id,
                                ctx.conversation_id,
                                serde_json::json!({
                                    "name": stage_name,
                                    "duration_ms": started_at.elapsed().as_millis() as u64,
                                }),
                            ))
                            .await;
                    }
                    Err(err) => {
                        ctx.events
                            .publish(Event::new(
                                event_types::STAGE_FAILED,
                                ctx.run_id,
                                ctx.conversation_id,
                                serde_json::json!({ "name": stage_name, "error": err.to_string() }),
                            ))
                            .await;
                    }
                }
                result
            });
            join_handles.push(handle);
        }

        let final_rx_placeholder = current_rx;
        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let final_ctx = ctx.clone();
        tokio::spawn(async move {
            let mut last_rx = final_rx_placeholder;
            while let Some(element) = last_rx.recv().await {
                if out_tx.send(element).await.is_err() {
                    break;
                }
            }
            drop(out_tx);

            let mut failed = None;
            for handle in join_handles {
                match handle.await {
                    Ok(Err(err)) if failed.is_none() => failed = Some(err),
                    Err(join_err) if failed.is_none() => {
                        failed = Some(crate::error::Error::StageFailure {
                            stage: join_err.to_string(),
                        })
                    }
                    _ => {}
                }
            }

            if final_ctx.cancellation.is_cancelled() {
                final_ctx
                    .events
                    .publish(Event::new(
                        event_types::PIPELINE_CANCELLED,
                        final_ctx.run_id,
                        final_ctx.conversation_id,
                        serde_json::json!({}),
                    ))
                    .await;
            } else if let Some(err) = failed {
                final_ctx
                    .events
                    .publish(Event::new(
                        event_types::PIPELINE_FAILED,
                        final_ctx.run_id,
                        final_ctx.conversation_id,
                        serde_json::json!({ "error": err.to_string() }),
                    ))
                    .await;
            } else {
                let cost = final_ctx.cost().await;
                final_ctx
                    .events
                    .publish(Event::new(
                        event_types::PIPELINE_COMPLETED,
                        final_ctx.run_id,
                        final_ctx.conversation_id,
                        serde_json::json!({
                            "total_cost_usd": cost.estimated_cost_usd,
                            "total_tokens": cost.input_tokens + cost.output_tokens,
                        }),
                    ))
                    .await;
            }
        });

        out_rx
    }
}
