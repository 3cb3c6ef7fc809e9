use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{event_types, AudioFormat, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event_bus::Event;
use crate::stage::Stage;
use crate::traits::VadAnalyzer;

const SPEECH_PROB_THRESHOLD: f32 = 0.3;
const MIN_SPEECH_MS: u64 = 300;
const MAX_TURN_MS: u64 = 30_000;
const SILENCE_CLOSE_MS: u64 = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Idle,
    DetectingSpeech,
    Speaking,
    DetectingSilence,
}

impl VadState {
    fn label(self) -> &'static str {
        match self {
            VadState::Idle => "idle",
            VadState::DetectingSpeech => "detecting_speech",
            VadState::Speaking => "speaking",
            VadState::DetectingSilence => "detecting_silence",
        }
    }
}

struct TurnBuffer {
    samples: Vec<u8>,
    sample_rate: u32,
    channels: u8,
    format: AudioFormat,
}

impl TurnBuffer {
    fn start(sample_rate: u32, channels: u8, format: AudioFormat) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels,
            format,
        }
    }
}

/// Duration of a PCM16 chunk in milliseconds. Compressed formats (Opus, MP3)
/// don't carry a fixed bytes-per-sample ratio, so their chunk duration is only
/// approximated from a conservative 16kHz mono PCM16-equivalent estimate; a
/// real deployment should prefer Pcm16 chunks feeding the VAD stage.
fn chunk_duration_ms(len: usize, sample_rate: u32, channels: u8, format: AudioFormat) -> u64 {
    let bytes_per_sample: usize = match format {
        AudioFormat::Pcm16 => 2,
        AudioFormat::Opus | AudioFormat::Mp3 => 2,
    };
    let bytes_per_frame = bytes_per_sample * channels.max(1) as usize;
    if sample_rate == 0 || bytes_per_frame == 0 {
        return 0;
    }
    let frames = (len / bytes_per_frame) as u64;
    frames * 1000 / sample_rate as u64
}

/// Turn-boundary accumulator sitting between raw audio input and the STT
/// stage. Runs one analyzer call per incoming `AudioData` chunk and drives a
/// speech/silence state machine: a turn only starts once speech has been
/// observed continuously for `MIN_SPEECH_MS` (debouncing false starts from a
/// single noisy chunk), and closes after `SILENCE_CLOSE_MS` of continuous
/// silence or after `MAX_TURN_MS` regardless of VAD state. On close, the
/// accumulated audio is emitted as a single consolidated `AudioData` element
/// (preserving sample rate/channel metadata) for the STT stage to transcribe.
pub struct VadStage {
    analyzer: Arc<dyn VadAnalyzer>,
}

impl VadStage {
    pub fn new(analyzer: Arc<dyn VadAnalyzer>) -> Self {
        Self { analyzer }
    }

    async fn transition(&self, ctx: &ExecutionContext, from: VadState, to: VadState) {
        ctx.events
            .publish(Event::new(
                event_types::VAD_STATE_CHANGED,
                ctx.run_id,
                ctx.conversation_id,
                serde_json::json!({ "from": from.label(), "to": to.label() }),
            ))
            .await;
    }
}

#[async_trait]
impl Stage for VadStage {
    fn name(&self) -> &str {
        "vad_accumulator"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        let mut state = VadState::Idle;
        let mut buffer: Option<TurnBuffer> = None;
        let mut speech_accum_ms: u64 = 0;
        let mut silence_accum_ms: u64 = 0;
        let mut turn_elapsed_ms: u64 = 0;

        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }

            let (samples, sample_rate, channels, format) = match &element {
                StreamElement::AudioData {
                    samples,
                    sample_rate,
                    channels,
                    format,
                } => (samples.clone(), *sample_rate, *channels, *format),
                _ => {
                    if output.send(element).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let probability = self.analyzer.speech_probability(&samples, sample_rate).await?;
            let duration_ms = chunk_duration_ms(samples.len(), sample_rate, channels, format);
            let is_speech = probability >= SPEECH_PROB_THRESHOLD;

            match state {
                VadState::Idle => {
                    if is_speech {
                        buffer = Some(TurnBuffer::start(sample_rate, channels, format));
                        buffer.as_mut().unwrap().samples.extend_from_slice(&samples);
                        speech_accum_ms = duration_ms;
                        self.transition(&ctx, VadState::Idle, VadState::DetectingSpeech).await;
                        state = VadState::DetectingSpeech;
                    }
                }
                VadState::DetectingSpeech => {
                    if is_speech {
                        if let Some(buf) = buffer.as_mut() {
                            buf.samples.extend_from_slice(&samples);
                        }
                        speech_accum_ms += duration_ms;
                        if speech_accum_ms >= MIN_SPEECH_MS {
                            turn_elapsed_ms = speech_accum_ms;
                            self.transition(&ctx, VadState::DetectingSpeech, VadState::Speaking).await;
                            state = VadState::Speaking;
                        }
                    } else {
                        // False start: discard and return to idle.
                        buffer = None;
                        speech_accum_ms = 0;
                        self.transition(&ctx, VadState::DetectingSpeech, VadState::Idle).await;
                        state = VadState::Idle;
                    }
                }
                VadState::Speaking => {
                    if let Some(buf) = buffer.as_mut() {
                        buf.samples.extend_from_slice(&samples);
                    }
                    turn_elapsed_ms += duration_ms;
                    if !is_speech {
                        silence_accum_ms = duration_ms;
                        self.transition(&ctx, VadState::Speaking, VadState::DetectingSilence).await;
                        state = VadState::DetectingSilence;
                    } else if turn_elapsed_ms >= MAX_TURN_MS {
                        complete_turn(&ctx, &output, buffer.take(), &mut state, self).await?;
                        speech_accum_ms = 0;
                        silence_accum_ms = 0;
                        turn_elapsed_ms = 0;
                    }
                }
                VadState::DetectingSilence => {
                    if let Some(buf) = buffer.as_mut() {
                        buf.samples.extend_from_slice(&samples);
                    }
                    turn_elapsed_ms += duration_ms;
                    if is_speech {
                        silence_accum_ms = 0;
                        self.transition(&ctx, VadState::DetectingSilence, VadState::Speaking).await;
                        state = VadState::Speaking;
                    } else {
                        silence_accum_ms += duration_ms;
                        if silence_accum_ms >= SILENCE_CLOSE_MS || turn_elapsed_ms >= MAX_TURN_MS {
                            complete_turn(&ctx, &output, buffer.take(), &mut state, self).await?;
                            speech_accum_ms = 0;
                            silence_accum_ms = 0;
                            turn_elapsed_ms = 0;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn complete_turn(
    ctx: &ExecutionContext,
    output: &mpsc::Sender<StreamElement>,
    buffer: Option<TurnBuffer>,
    state: &mut VadState,
    stage: &VadStage,
) -> Result<()> {
    if let Some(buf) = buffer {
        let element = StreamElement::AudioData {
            samples: buf.samples,
            sample_rate: buf.sample_rate,
            channels: buf.channels,
            format: buf.format,
        };
        let _ = output.send(element).await;
    }
    stage.transition(ctx, *state, VadState::Idle).await;
    *state = VadState::Idle;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use uuid::Uuid;

    struct ThresholdAnalyzer;

    #[async_trait]
    impl VadAnalyzer for ThresholdAnalyzer {
        async fn speech_probability(&self, chunk: &[u8], _sample_rate: u32) -> Result<f32> {
            // First byte of each chunk doubles as its probability*10 for
            // deterministic test fixtures.
            Ok(chunk.first().copied().unwrap_or(0) as f32 / 10.0)
        }
    }

    fn chunk(speech: bool) -> StreamElement {
        StreamElement::AudioData {
            samples: vec![if speech { 8 } else { 0 }; 320],
            sample_rate: 16_000,
            channels: 1,
            format: AudioFormat::Pcm16,
        }
    }

    /// A one-second chunk (16kHz mono PCM16): long enough that two speech
    /// chunks clear `MIN_SPEECH_MS` and two silence chunks clear
    /// `SILENCE_CLOSE_MS`.
    fn long_chunk(speech: bool) -> StreamElement {
        StreamElement::AudioData {
            samples: vec![if speech { 8 } else { 0 }; 32_000],
            sample_rate: 16_000,
            channels: 1,
            format: AudioFormat::Pcm16,
        }
    }

    #[tokio::test]
    async fn completes_a_turn_after_sustained_silence() {
        let stage = VadStage::new(Arc::new(ThresholdAnalyzer));
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)));
        let (tx, rx) = mpsc::channel(16);
        for _ in 0..2 {
            tx.send(long_chunk(true)).await.unwrap();
        }
        for _ in 0..2 {
            tx.send(long_chunk(false)).await.unwrap();
        }
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(16);
        stage.process(rx, out_tx, ctx).await.unwrap();

        let mut saw_turn = false;
        while let Some(element) = out_rx.recv().await {
            if matches!(element, StreamElement::AudioData { .. }) {
                saw_turn = true;
            }
        }
        assert!(saw_turn);
    }

    #[tokio::test]
    async fn false_start_does_not_emit_a_turn() {
        let stage = VadStage::new(Arc::new(ThresholdAnalyzer));
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, true, Arc::new(NoOpEventBus)));
        let (tx, rx) = mpsc::channel(16);
        tx.send(chunk(true)).await.unwrap();
        tx.send(chunk(false)).await.unwrap();
        drop(tx);

        let (out_tx, mut out_rx) = mpsc::channel(16);
        stage.process(rx, out_tx, ctx).await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
