//! Transparent instrumentation stages: each forwards every element unchanged
//! and only observes the stream passing through, so they can be inserted
//! anywhere in a chain without changing its semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::StreamElement;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;

#[derive(Debug, Default)]
struct Counters {
    text_deltas: AtomicU64,
    audio_chunks: AtomicU64,
    messages: AtomicU64,
    tool_calls: AtomicU64,
    tool_results: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub text_deltas: u64,
    pub audio_chunks: u64,
    pub messages: u64,
    pub tool_calls: u64,
    pub tool_results: u64,
    pub errors: u64,
}

/// Tallies element counts by kind as they flow through, for a chain to
/// expose simple throughput metrics without every stage reimplementing the
/// bookkeeping itself.
#[derive(Default)]
pub struct MetricsStage {
    counters: Counters,
}

impl MetricsStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            text_deltas: self.counters.text_deltas.load(Ordering::Relaxed),
            audio_chunks: self.counters.audio_chunks.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
            tool_calls: self.counters.tool_calls.load(Ordering::Relaxed),
            tool_results: self.counters.tool_results.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn tally(&self, element: &StreamElement) {
        let counter = match element {
            StreamElement::TextDelta(_) => &self.counters.text_deltas,
            StreamElement::AudioData { .. } => &self.counters.audio_chunks,
            StreamElement::Message(_) => &self.counters.messages,
            StreamElement::ToolCall(_) => &self.counters.tool_calls,
            StreamElement::ToolResult(_) => &self.counters.tool_results,
            StreamElement::Error(_) => &self.counters.errors,
            StreamElement::Finish(_) | StreamElement::Metadata(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Stage for MetricsStage {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            self.tally(&element);
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Emits a `tracing::debug!` event per element, tagged with the run and
/// conversation ids, so a chain's traffic shows up in whatever subscriber the
/// host process has installed without a dedicated event-bus listener.
pub struct TracingStage {
    label: &'static str,
}

impl TracingStage {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

#[async_trait]
impl Stage for TracingStage {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            debug!(
                run_id = %ctx.run_id,
                conversation_id = %ctx.conversation_id,
                stage = self.label,
                kind = element_kind(&element),
                "stream element"
            );
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Dumps every element at `trace` level including its full payload — far
/// noisier than [`TracingStage`], meant to be wired in only while chasing a
/// specific bug, never left in a production chain.
pub struct DebugStage {
    label: &'static str,
}

impl DebugStage {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

#[async_trait]
impl Stage for DebugStage {
    fn name(&self) -> &str {
        "debug"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            trace!(stage = self.label, element = ?element, "stream element (full)");
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn element_kind(element: &StreamElement) -> &'static str {
    match element {
        StreamElement::TextDelta(_) => "text_delta",
        StreamElement::AudioData { .. } => "audio_data",
        StreamElement::Message(_) => "message",
        StreamElement::ToolCall(_) => "tool_call",
        StreamElement::ToolResult(_) => "tool_result",
        StreamElement::Finish(_) => "finish",
        StreamElement::Error(_) => "error",
        StreamElement::Metadata(_) => "metadata",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use uuid::Uuid;

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)))
    }

    #[tokio::test]
    async fn metrics_stage_tallies_by_kind_and_forwards_unchanged() {
        let stage = MetricsStage::new();
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamElement::text_delta("a")).await.unwrap();
        tx.send(StreamElement::text_delta("b")).await.unwrap();
        tx.send(StreamElement::error("oops")).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, ctx()).await.unwrap();

        let mut forwarded = 0;
        while out_rx.recv().await.is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3);

        let snapshot = stage.snapshot();
        assert_eq!(snapshot.text_deltas, 2);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn tracing_stage_forwards_every_element() {
        let stage = TracingStage::new("test");
        let (tx, rx) = mpsc::channel(2);
        tx.send(StreamElement::text_delta("hi")).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(2);
        stage.process(rx, out_tx, ctx()).await.unwrap();
        assert!(matches!(out_rx.recv().await.unwrap(), StreamElement::TextDelta(_)));
    }
}
