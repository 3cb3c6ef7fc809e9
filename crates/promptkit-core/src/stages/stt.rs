use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use promptkit_contracts::{Message, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;
use crate::traits::{AudioBuffer, SttService};

/// Sits downstream of the VAD stage: takes each completed turn's accumulated
/// `AudioData` element and transcribes it. Streaming services forward partial
/// `TextDelta`s as they arrive and finish with a `Message`; non-streaming
/// services emit the `Message` once transcription completes.
pub struct SttStage {
    service: Arc<dyn SttService>,
    language_hint: Option<String>,
}

impl SttStage {
    pub fn new(service: Arc<dyn SttService>, language_hint: Option<String>) -> Self {
        Self { service, language_hint }
    }
}

#[async_trait]
impl Stage for SttStage {
    fn name(&self) -> &str {
        "stt_transcribe"
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
            let (samples, sample_rate, channels) = match element {
                StreamElement::AudioData {
                    samples,
                    sample_rate,
                    channels,
                    ..
                } => (samples, sample_rate, channels),
                other => {
                    if output.send(other).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let buffer = AudioBuffer {
                samples,
                sample_rate,
                channels,
                language_hint: self.language_hint.clone(),
            };
            let mut transcript = self.service.transcribe(buffer).await?;
            let mut accumulated = String::new();

            while let Some(element) = transcript.next().await {
                match element? {
                    StreamElement::TextDelta(delta) => {
                        accumulated.push_str(&delta);
                        if output.send(StreamElement::TextDelta(delta)).await.is_err() {
                            return Ok(());
                        }
                    }
                    StreamElement::Message(message) => {
                        if output.send(StreamElement::Message(message)).await.is_err() {
                            return Ok(());
                        }
                    }
                    other => {
                        if output.send(other).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if self.service.is_streaming() && !accumulated.is_empty() {
                if output.send(StreamElement::Message(Message::user(accumulated))).await.is_err() {
                    return Ok(());
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
    use promptkit_contracts::AudioFormat;
    use uuid::Uuid;

    struct FixedTranscriber;

    #[async_trait]
    impl SttService for FixedTranscriber {
        fn is_streaming(&self) -> bool {
            false
        }

        async fn transcribe(&self, _audio: AudioBuffer) -> Result<ElementStream> {
            let items = vec![Ok(StreamElement::Message(Message::user("hello there")))];
            Ok(Box::pin(tokio_stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn emits_final_message_from_non_streaming_service() {
        let stage = SttStage::new(Arc::new(FixedTranscriber), None);
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)));
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamElement::AudioData {
            samples: vec![0; 100],
            sample_rate: 16_000,
            channels: 1,
            format: AudioFormat::Pcm16,
        })
        .await
        .unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, ctx).await.unwrap();

        match out_rx.recv().await.unwrap() {
            StreamElement::Message(message) => assert_eq!(message.text(), "hello there"),
            other => panic!("unexpected element: {other:?}"),
        }
    }
}
