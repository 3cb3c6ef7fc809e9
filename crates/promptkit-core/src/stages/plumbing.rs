//! DAG composition helpers. The builder in `crate::stage` only ever wires one
//! stage's output to the next one's input; fan-out/fan-in shapes (duplex
//! audio's parallel STT/TTS branches, a side channel for out-of-band control
//! messages) are built by inserting these into a chain, or by wiring their
//! free-function equivalents directly in `crate::pipeline`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::select_all;
use promptkit_contracts::StreamElement;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;

/// Splits one input stream into a "matched" side-channel (returned from
/// `new`) and a "rest" stream forwarded to `output` as normal. The common
/// 2-way branch: route audio elements to a TTS-interrupt watcher while
/// everything else continues down the main chain, for example.
pub struct RouterStage<F> {
    predicate: F,
    diverted: mpsc::Sender<StreamElement>,
}

impl<F> RouterStage<F>
where
    F: Fn(&StreamElement) -> bool + Send + Sync + 'static,
{
    /// Returns the stage plus the receiver end of the diverted branch; the
    /// caller wires that receiver into whatever chain should consume it.
    pub fn new(predicate: F, buffer: usize) -> (Self, mpsc::Receiver<StreamElement>) {
        let (diverted, rx) = mpsc::channel(buffer);
        (Self { predicate, diverted }, rx)
    }
}

#[async_trait]
impl<F> Stage for RouterStage<F>
where
    F: Fn(&StreamElement) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "router"
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
            let routed = if (self.predicate)(&element) {
                self.diverted.send(element).await
            } else {
                output.send(element).await
            };
            if routed.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// A 2-way [`RouterStage`] whose predicate is simply "does this match",
/// kept as a distinctly-named alias since a binary branch is by far the most
/// common shape callers reach for.
pub type BranchStage<F> = RouterStage<F>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// The stage's normal pipeline input is drained first when both sides
    /// have an element ready.
    Primary,
    /// The side channel is drained first — used for out-of-band control
    /// signals (e.g. a barge-in notice) that must preempt ordinary content.
    Secondary,
}

/// Fans a side channel into the stage's own input, forwarding both onto a
/// single `output`. Closes once both sides are exhausted.
pub struct MergeStage {
    secondary: Mutex<Option<mpsc::Receiver<StreamElement>>>,
    bias: Bias,
}

impl MergeStage {
    pub fn new(secondary: mpsc::Receiver<StreamElement>, bias: Bias) -> Self {
        Self {
            secondary: Mutex::new(Some(secondary)),
            bias,
        }
    }
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &str {
        "merge"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let mut secondary = self
            .secondary
            .lock()
            .await
            .take()
            .expect("MergeStage::process must only be invoked once per instance");

        loop {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            let next = match self.bias {
                Bias::Secondary => tokio::select! {
                    biased;
                    e = secondary.recv() => Side::Secondary(e),
                    e = input.recv() => Side::Primary(e),
                },
                Bias::Primary => tokio::select! {
                    biased;
                    e = input.recv() => Side::Primary(e),
                    e = secondary.recv() => Side::Secondary(e),
                },
            };
            match next {
                Side::Primary(Some(element)) | Side::Secondary(Some(element)) => {
                    if output.send(element).await.is_err() {
                        break;
                    }
                }
                Side::Primary(None) => {
                    while let Some(element) = secondary.recv().await {
                        if output.send(element).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                Side::Secondary(None) => {
                    while let Some(element) = input.recv().await {
                        if output.send(element).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

enum Side {
    Primary(Option<StreamElement>),
    Secondary(Option<StreamElement>),
}

/// N-way fan-in with no bias, for wiring arbitrary branch counts (e.g. every
/// per-capability sub-pipeline in a fanned-out duplex mode) outside of a
/// single `Stage`'s fixed two-sided shape. Closes `output`'s sender once
/// every input receiver has closed.
pub fn merge_all(receivers: Vec<mpsc::Receiver<StreamElement>>, buffer: usize) -> mpsc::Receiver<StreamElement> {
    let (tx, rx) = mpsc::channel(buffer);
    tokio::spawn(async move {
        let mut merged = select_all(receivers.into_iter().map(ReceiverStream::new));
        while let Some(element) = merged.next().await {
            if tx.send(element).await.is_err() {
                break;
            }
        }
    });
    rx
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
    async fn router_diverts_matching_elements() {
        let (stage, mut diverted_rx) = RouterStage::new(|e| matches!(e, StreamElement::Error(_)), 4);
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamElement::text_delta("ok")).await.unwrap();
        tx.send(StreamElement::error("boom")).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, ctx()).await.unwrap();

        assert!(matches!(out_rx.recv().await.unwrap(), StreamElement::TextDelta(_)));
        assert!(out_rx.recv().await.is_none());
        assert!(matches!(diverted_rx.recv().await.unwrap(), StreamElement::Error(_)));
    }

    #[tokio::test]
    async fn merge_forwards_both_sides_until_exhausted() {
        let (sec_tx, sec_rx) = mpsc::channel(4);
        let stage = MergeStage::new(sec_rx, Bias::Primary);
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamElement::text_delta("primary")).await.unwrap();
        drop(tx);
        sec_tx.send(StreamElement::text_delta("secondary")).await.unwrap();
        drop(sec_tx);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        stage.process(rx, out_tx, ctx()).await.unwrap();

        let mut seen = Vec::new();
        while let Some(StreamElement::TextDelta(text)) = out_rx.recv().await {
            seen.push(text);
        }
        seen.sort();
        assert_eq!(seen, vec!["primary".to_string(), "secondary".to_string()]);
    }

    #[tokio::test]
    async fn merge_all_combines_arbitrary_receiver_count() {
        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        let (tx3, rx3) = mpsc::channel(4);
        tx1.send(StreamElement::text_delta("a")).await.unwrap();
        tx2.send(StreamElement::text_delta("b")).await.unwrap();
        tx3.send(StreamElement::text_delta("c")).await.unwrap();
        drop(tx1);
        drop(tx2);
        drop(tx3);

        let mut merged = merge_all(vec![rx1, rx2, rx3], 8);
        let mut count = 0;
        while merged.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
