use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use promptkit_contracts::{Message, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;
use crate::traits::{AudioBuffer, SttService};

/// Sits directly downstream of the VAD accumulator. Where the general-purpose
/// [`crate::stages::stt::SttStage`] relays partial `TextDelta`s for services
/// that support it, this stage's whole job is the turn-minimality guarantee:
/// each completed-turn `AudioData` element it receives produces exactly one
/// `message(user, transcript)`, regardless of whether the backing STT service
/// streams internally. Any deltas the service emits while transcribing are
/// accumulated rather than forwarded, since downstream context-builder/state-
/// store stages expect one message per turn, not a partial stream of them.
pub struct AudioTurnStage {
    service: Arc<dyn SttService>,
    language_hint: Option<String>,
}

impl AudioTurnStage {
    pub fn new(service: Arc<dyn SttService>, language_hint: Option<String>) -> Self {
        Self { service, language_hint }
    }
}

#[async_trait]
impl Stage for AudioTurnStage {
    fn name(&self) -> &str {
        "audio_turn_boundary"
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
                    StreamElement::TextDelta(delta) => accumulated.push_str(&delta),
                    StreamElement::Message(message) => accumulated.push_str(&message.text()),
                    _ => {}
                }
            }

            if output
                .send(StreamElement::Message(Message::user(accumulated)))
                .await
                .is_err()
            {
                break;
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

    struct StreamingTranscriber;

    #[async_trait]
    impl SttService for StreamingTranscriber {
        fn is_streaming(&self) -> bool {
            true
        }

        async fn transcribe(&self, _audio: AudioBuffer) -> Result<ElementStream> {
            let items = vec![
                Ok(StreamElement::TextDelta("what's the ".into())),
                Ok(StreamElement::TextDelta("weather like".into())),
            ];
            Ok(Box::pin(tokio_stream::iter(items)))
        }
    }

    fn turn(bytes: Vec<u8>) -> StreamElement {
        StreamElement::AudioData {
            samples: bytes,
            sample_rate: 16_000,
            channels: 1,
            format: AudioFormat::Pcm16,
        }
    }

    #[tokio::test]
    async fn emits_exactly_one_message_per_turn() {
        let stage = AudioTurnStage::new(Arc::new(StreamingTranscriber), None);
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)));
        let (tx, rx) = mpsc::channel(4);
        tx.send(turn(vec![0; 100])).await.unwrap();
        tx.send(turn(vec![1; 100])).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(4);
        stage.process(rx, out_tx, ctx).await.unwrap();

        let mut messages = Vec::new();
        while let Some(StreamElement::Message(message)) = out_rx.recv().await {
            messages.push(message.text());
        }
        assert_eq!(messages, vec!["what's the weather like".to_string(), "what's the weather like".to_string()]);
    }
}
