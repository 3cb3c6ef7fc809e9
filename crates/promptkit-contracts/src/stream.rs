use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tool::{ToolCall, ToolResult};

/// The discriminated union flowing between stages. A `Stage` reads these off
/// its input channel and writes them to its output channel, possibly
/// transforming, filtering, or fanning them out along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamElement {
    TextDelta(String),
    AudioData {
        samples: Vec<u8>,
        sample_rate: u32,
        channels: u8,
        format: AudioFormat,
    },
    Message(Message),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Finish(FinishReason),
    Error(String),
    Metadata(serde_json::Map<String, serde_json::Value>),
}

impl StreamElement {
    pub fn text_delta(s: impl Into<String>) -> Self {
        StreamElement::TextDelta(s.into())
    }

    pub fn finish(reason: FinishReason) -> Self {
        StreamElement::Finish(reason)
    }

    pub fn error(detail: impl Into<String>) -> Self {
        StreamElement::Error(detail.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamElement::Finish(_) | StreamElement::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
    Opus,
    Mp3,
}

/// Why a pipeline run (or a single streaming call within it) stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Pending { call_ids: Vec<String> },
    Interrupted,
    Cancelled,
    Length,
    Error { detail: String },
}
