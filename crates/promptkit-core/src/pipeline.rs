//! Per-mode pipeline construction. The orchestrator (`promptkit-runtime`)
//! owns a `Pack`, a prompt name, and a set of collaborators for the lifetime
//! of a conversation; these functions turn that bundle into the concrete
//! stage chain for a given invocation mode, leaving `PipelineBuilder`'s own
//! job (channel wiring, per-stage instrumentation) untouched.

use std::sync::Arc;

use promptkit_contracts::Prompt;

use crate::stage::{Pipeline, PipelineBuilder, DEFAULT_AUDIO_BUFFER, DEFAULT_TEXT_BUFFER};
use crate::stages::audio_turn::AudioTurnStage;
use crate::stages::context_builder::ContextBuilderStage;
use crate::stages::media::MediaExternalizerStage;
use crate::stages::provider::{ProviderCallStage, ProviderMode, ToolPolicy};
use crate::stages::state_store::{StateStoreLoadStage, StateStoreSaveStage};
use crate::stages::template::TemplateStage;
use crate::stages::tts::TtsStage;
use crate::stages::vad::VadStage;
use crate::stages::validation::{ValidationPhase, ValidationStage};
use crate::traits::{CallParams, MediaStorage, ProviderAdapter, SttService, StateStore, TemplateRenderer, ToolRegistry, TtsService, VadAnalyzer, Validator};

/// Collaborators shared by every pipeline mode. `promptkit-runtime` builds
/// one of these per conversation and reuses it across every `send`/
/// `send_stream` call.
pub struct PipelineDeps {
    pub provider: Arc<dyn ProviderAdapter>,
    pub tools: Arc<dyn ToolRegistry>,
    pub tool_policy: ToolPolicy,
    pub state_store: Arc<dyn StateStore>,
    pub media_storage: Arc<dyn MediaStorage>,
    pub template_renderer: Arc<dyn TemplateRenderer>,
    pub pre_validators: Vec<Arc<dyn Validator>>,
    pub post_validators: Vec<Arc<dyn Validator>>,
    pub prompt: Prompt,
    pub tool_descriptors: Vec<promptkit_contracts::ToolDescriptor>,
}

impl PipelineDeps {
    fn call_params(&self) -> CallParams {
        let params = &self.prompt.parameters;
        CallParams {
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            seed: params.seed,
            response_format: None,
        }
    }

    fn common_prefix(&self, builder: PipelineBuilder) -> PipelineBuilder {
        builder
            .chain(Arc::new(StateStoreLoadStage::new(self.state_store.clone())))
            .chain(Arc::new(ContextBuilderStage))
            .chain(Arc::new(MediaExternalizerStage::new(self.media_storage.clone())))
            .chain(Arc::new(TemplateStage::new(
                self.template_renderer.clone(),
                self.prompt.clone(),
                self.tool_descriptors.clone(),
            )))
            .chain(Arc::new(ValidationStage::new(
                self.pre_validators.clone(),
                ValidationPhase::Pre,
            )))
    }

    fn common_suffix(&self, builder: PipelineBuilder) -> PipelineBuilder {
        builder
            .chain(Arc::new(ValidationStage::new(
                self.post_validators.clone(),
                ValidationPhase::Post,
            )))
            .chain(Arc::new(StateStoreSaveStage::new(self.state_store.clone())))
    }

    /// Text mode: a single user message in, a streamed assistant response
    /// (with tool-calling rounds) out.
    pub fn build_text_pipeline(&self) -> Pipeline {
        let builder = PipelineBuilder::new().with_buffer(DEFAULT_TEXT_BUFFER);
        let builder = self.common_prefix(builder).chain(Arc::new(ProviderCallStage::new(
            self.provider.clone(),
            self.tools.clone(),
            self.tool_policy.clone(),
            ProviderMode::StreamingText,
            self.call_params(),
        )));
        self.common_suffix(builder).build()
    }

    /// VAD mode: raw audio chunks in, accumulated into turns, transcribed,
    /// run through the normal text pipeline, and synthesized back to audio.
    pub fn build_vad_pipeline(&self, vad: Arc<dyn VadAnalyzer>, stt: Arc<dyn SttService>, tts: Arc<dyn TtsService>, language_hint: Option<String>) -> Pipeline {
        let builder = PipelineBuilder::new().with_buffer(DEFAULT_AUDIO_BUFFER);
        let builder = builder
            .chain(Arc::new(VadStage::new(vad)))
            .chain(Arc::new(AudioTurnStage::new(stt, language_hint)));
        let builder = self.common_prefix(builder).chain(Arc::new(ProviderCallStage::new(
            self.provider.clone(),
            self.tools.clone(),
            self.tool_policy.clone(),
            ProviderMode::StreamingText,
            self.call_params(),
        )));
        let builder = builder.chain(Arc::new(TtsStage::new(tts)));
        self.common_suffix(builder).build()
    }

    /// Duplex mode: the provider itself handles turn detection and speaks
    /// audio directly; state load/save and media externalization still run
    /// around it, but there is no separate VAD/STT/TTS stage in the chain.
    pub fn build_duplex_pipeline(&self) -> Pipeline {
        let builder = PipelineBuilder::new().with_buffer(DEFAULT_AUDIO_BUFFER);
        let builder = self.common_prefix(builder).chain(Arc::new(ProviderCallStage::new(
            self.provider.clone(),
            self.tools.clone(),
            self.tool_policy.clone(),
            ProviderMode::NativeDuplex,
            self.call_params(),
        )));
        self.common_suffix(builder).build()
    }
}
