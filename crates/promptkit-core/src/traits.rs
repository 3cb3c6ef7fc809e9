//! L1 collaborator traits: the injectable, side-effecting services stages
//! depend on. Every concrete implementation (a real HTTP provider, a
//! Postgres-backed state store, ...) lives in its own crate; `promptkit-core`
//! only fixes the contract and ships in-memory test doubles in `memory.rs`.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use promptkit_contracts::{Message, StorageReference, StreamElement, ToolDescriptor};
use uuid::Uuid;

use crate::error::Result;
use crate::tools::ToolExecutionResult;

/// A stream of stream elements, each fallible independently so a transport
/// error mid-stream doesn't require tearing down the whole channel.
pub type ElementStream = BoxStream<'static, Result<StreamElement>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Streaming,
    Tools,
    AudioIn,
    AudioOut,
    VideoIn,
    NativeDuplex,
    StructuredOutput,
}

#[derive(Debug, Clone, Default)]
pub struct CallParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub response_format: Option<serde_json::Value>,
}

/// A chat-completion / streaming / duplex LLM backend. Implemented by
/// `promptkit-anthropic`, `promptkit-openai`, and any out-of-tree adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        params: &CallParams,
    ) -> Result<ProviderResponse>;

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        params: &CallParams,
    ) -> Result<ElementStream>;

    /// Bidirectional audio. Only called when `supports(NativeDuplex)` is true.
    async fn duplex(&self, input: ElementStream, params: &CallParams) -> Result<ElementStream>;

    fn supports(&self, capability: Capability) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub message: Message,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub raw: Option<serde_json::Value>,
}

/// bytes → text.
#[async_trait]
pub trait SttService: Send + Sync {
    /// When true, `transcribe` emits incremental `TextDelta` elements;
    /// otherwise it emits a single final `Message` element.
    fn is_streaming(&self) -> bool;

    async fn transcribe(&self, audio: AudioBuffer) -> Result<ElementStream>;
}

#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u8,
    pub language_hint: Option<String>,
}

/// text → audio chunks.
#[async_trait]
pub trait TtsService: Send + Sync {
    fn supports_interruption(&self) -> bool;

    /// Synthesizes one chunk of text into zero or more `AudioData` elements.
    /// The interruptible TTS stage calls this per accumulated chunk and races
    /// it against the context's interrupt flag.
    async fn synthesize(&self, text: &str) -> Result<ElementStream>;
}

/// audio chunk → speech probability, used by the VAD accumulator stage to
/// drive its state machine.
#[async_trait]
pub trait VadAnalyzer: Send + Sync {
    async fn speech_probability(&self, chunk: &[u8], sample_rate: u32) -> Result<f32>;
}

/// name → descriptor lookup plus dispatch. Kept as one trait (rather than a
/// separate registry/executor pair) since every implementation in this
/// workspace backs both with the same table.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<ToolDescriptor>;
    fn all(&self) -> Vec<ToolDescriptor>;

    async fn execute(&self, descriptor: &ToolDescriptor, args: serde_json::Value) -> ToolExecutionResult;
}

/// Opaque, conversation-scoped persisted state. The core only ever produces
/// JSON-safe structures; the store treats the value as opaque.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub variables: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, conversation_id: Uuid) -> Result<Option<ConversationState>>;
    async fn save(&self, conversation_id: Uuid, state: ConversationState) -> Result<()>;
    async fn delete(&self, conversation_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn store(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: serde_json::Value,
    ) -> Result<StorageReference>;

    async fn retrieve(&self, reference: &StorageReference) -> Result<Vec<u8>>;
    async fn delete(&self, reference: &StorageReference) -> Result<()>;
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &HashMap<String, String>) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Passed,
    Failed { detail: String },
}

/// A content policy check. `validate_batch` covers the non-streaming path;
/// streaming-capable validators additionally implement `validate_delta`,
/// called once per text/audio delta as it flows through the stage. The
/// default buffers (accumulates) rather than checking each delta in
/// isolation, per the buffering default recorded for the streaming-validator
/// open question.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn is_streaming_capable(&self) -> bool {
        false
    }

    async fn validate_batch(&self, text: &str) -> Result<ValidationOutcome>;

    async fn validate_delta(&self, accumulated_text: &str) -> Result<ValidationOutcome> {
        self.validate_batch(accumulated_text).await
    }
}
