//! Event-type string constants and payload shapes, following the teacher's
//! `event.rs` namespaced-dot-notation convention (`pipeline.started`,
//! `stage.completed`, ...). `promptkit_core::event_bus` carries the runtime
//! `Event` envelope and dispatch machinery; this module only fixes the wire
//! vocabulary so producers and subscribers agree on type strings and payload
//! fields without depending on each other directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod event_types {
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";

    pub const STAGE_STARTED: &str = "stage.started";
    pub const STAGE_COMPLETED: &str = "stage.completed";
    pub const STAGE_FAILED: &str = "stage.failed";

    pub const PROVIDER_CALL_STARTED: &str = "provider.call.started";
    pub const PROVIDER_CALL_COMPLETED: &str = "provider.call.completed";
    pub const PROVIDER_CALL_FAILED: &str = "provider.call.failed";

    pub const TOOL_CALL_STARTED: &str = "tool.call.started";
    pub const TOOL_CALL_COMPLETED: &str = "tool.call.completed";
    pub const TOOL_CALL_FAILED: &str = "tool.call.failed";

    pub const VALIDATION_PASSED: &str = "validation.passed";
    pub const VALIDATION_FAILED: &str = "validation.failed";

    pub const VAD_STATE_CHANGED: &str = "vad.state.changed";
    pub const MEDIA_EXTERNALIZED: &str = "media.externalized";

    pub const STATE_LOADED: &str = "state.loaded";
    pub const STATE_SAVED: &str = "state.saved";
}

/// Payload shapes for the event types above. Kept as a loosely-tagged enum
/// (rather than one struct per event type wired through a registry) so a
/// listener can match on the type string from `event_types` and deserialize
/// only the payload it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    PipelineStarted {
        run_id: Uuid,
    },
    PipelineCompleted {
        run_id: Uuid,
        total_cost_usd: f64,
        total_tokens: u64,
    },
    PipelineFailed {
        run_id: Uuid,
        error: String,
    },
    PipelineCancelled {
        run_id: Uuid,
    },
    StageStarted {
        name: String,
        stage_type: String,
    },
    StageCompleted {
        name: String,
        duration_ms: u64,
    },
    StageFailed {
        name: String,
        error: String,
    },
    ProviderCallStarted {
        provider_id: String,
        model_id: String,
        round: u32,
    },
    ProviderCallCompleted {
        provider_id: String,
        model_id: String,
        round: u32,
        input_tokens: u64,
        output_tokens: u64,
        finish_reason: String,
    },
    ProviderCallFailed {
        provider_id: String,
        model_id: String,
        round: u32,
        error: String,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
    },
    ToolCallCompleted {
        call_id: String,
        name: String,
        duration_ms: u64,
        status: String,
    },
    ToolCallFailed {
        call_id: String,
        name: String,
        error: String,
    },
    ValidationPassed {
        validator: String,
    },
    ValidationFailed {
        validator: String,
        detail: String,
        kind: String,
    },
    VadStateChanged {
        from: String,
        to: String,
    },
    MediaExternalized {
        size_bytes: usize,
        hash: String,
    },
    StateLoaded {
        conversation_id: Uuid,
        found: bool,
    },
    StateSaved {
        conversation_id: Uuid,
    },
}
