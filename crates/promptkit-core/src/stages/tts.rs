use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use promptkit_contracts::StreamElement;
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;
use crate::traits::TtsService;

const SENTENCE_BOUNDARIES: [char; 4] = ['.', '!', '?', '\n'];

/// Chunks incoming `TextDelta`s into sentence-ish units and synthesizes each
/// as it completes, rather than waiting for the whole response — this is what
/// lets audio start playing before the model has finished generating text.
/// When the service supports interruption, a mid-synthesis `ctx.interrupt()`
/// (the user barging in) stops forwarding audio immediately and the remaining
/// input is drained silently, mirroring the validation stage's approach.
pub struct TtsStage {
    service: Arc<dyn TtsService>,
}

impl TtsStage {
    pub fn new(service: Arc<dyn TtsService>) -> Self {
        Self { service }
    }

    async fn flush(&self, buffer: &mut String, output: &mpsc::Sender<StreamElement>, ctx: &ExecutionContext) -> Result<bool> {
        if buffer.trim().is_empty() {
            buffer.clear();
            return Ok(true);
        }
        let text = std::mem::take(buffer);
        let mut audio = self.service.synthesize(&text).await?;
        let interruptible = self.service.supports_interruption();

        while let Some(element) = audio.next().await {
            if interruptible && ctx.is_interrupted() {
                return Ok(false);
            }
            if output.send(element?).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &str {
        "tts_synthesize"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let mut buffer = String::new();
        let mut interrupted = false;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            if interrupted {
                continue;
            }

            match element {
                StreamElement::TextDelta(delta) => {
                    buffer.push_str(&delta);
                    if buffer.ends_with(SENTENCE_BOUNDARIES.as_slice()) {
                        if !self.flush(&mut buffer, &output, &ctx).await? {
                            interrupted = true;
                        }
                    }
                }
                StreamElement::Finish(reason) => {
                    if !self.flush(&mut buffer, &output, &ctx).await? {
                        interrupted = true;
                    }
                    if output.send(StreamElement::Finish(reason)).await.is_err() {
                        break;
                    }
                }
                other => {
                    if output.send(other).await.is_err() {
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
    use crate::traits::ElementStream;
    use promptkit_contracts::{AudioFormat, FinishReason};
    use uuid::Uuid;

    struct EchoTts;

    #[async_trait]
    impl TtsService for EchoTts {
        fn supports_interruption(&self) -> bool {
            false
        }

        async fn synthesize(&self, text: &str) -> Result<ElementStream> {
            let samples = text.as_bytes().to_vec();
            let items = vec![Ok(StreamElement::AudioData {
                samples,
                sample_rate: 16_000,
                channels: 1,
                format: AudioFormat::Pcm16,
            })];
            Ok(Box::pin(tokio_stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn synthesizes_on_sentence_boundary_and_at_finish() {
        let stage = TtsStage::new(Arc::new(EchoTts));
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)));
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamElement::text_delta("Hello world.")).await.unwrap();
        tx.send(StreamElement::text_delta(" Still going")).await.unwrap();
        tx.send(StreamElement::Finish(FinishReason::Stop)).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(8);
        stage.process(rx, out_tx, ctx).await.unwrap();

        let mut audio_chunks = 0;
        let mut saw_finish = false;
        while let Some(element) = out_rx.recv().await {
            match element {
                StreamElement::AudioData { .. } => audio_chunks += 1,
                StreamElement::Finish(_) => saw_finish = true,
                _ => {}
            }
        }
        assert_eq!(audio_chunks, 2);
        assert!(saw_finish);
    }
}
