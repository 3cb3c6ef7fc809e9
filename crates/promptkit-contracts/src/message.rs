use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// Role of a message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single turn in a conversation.
///
/// Exactly one of `content`/`parts` carries primary data. `tool_calls` is only
/// populated on assistant messages; `tool_result` only on tool messages. When
/// `tool_calls` is non-empty, the next provider invocation requires matching
/// `tool` messages with identical call IDs first — see
/// `promptkit_core::tools::patch_dangling_tool_calls` for the repair applied
/// when a turn is interrupted before that invariant is satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            parts: None,
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            parts: None,
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            parts: None,
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            parts: None,
            tool_calls,
            tool_result: None,
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: None,
            parts: None,
            tool_calls: Vec::new(),
            tool_result: Some(result),
        }
    }

    /// Plain-text view used by providers/validators that don't care about
    /// multipart structure. Concatenates `parts` text components when
    /// `content` is absent.
    pub fn text(&self) -> String {
        if let Some(content) = &self.content {
            return content.clone();
        }
        self.parts
            .as_ref()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text(t) => Some(t.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }

    /// Call IDs in `tool_calls` that have no matching `tool` message with the
    /// same ID in `history` yet.
    pub fn dangling_call_ids(history: &[Message]) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for msg in history {
            match msg.role {
                Role::Assistant => {
                    for call in &msg.tool_calls {
                        pending.push(call.id.clone());
                    }
                }
                Role::Tool => {
                    if let Some(result) = &msg.tool_result {
                        pending.retain(|id| id != &result.call_id);
                    }
                }
                _ => {}
            }
        }
        pending
    }
}

/// A piece of multimodal content within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text(String),
    Image(MediaContent),
    Audio(MediaContent),
    Video(MediaContent),
}

/// Exactly one of `source`'s variants carries data for a given `MediaContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaContent {
    pub source: MediaSource,
    pub mime_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl MediaContent {
    /// Byte length of inline data, when the source is inline. Used by the
    /// media-externalizer stage to decide whether a threshold is exceeded.
    pub fn inline_len(&self) -> Option<usize> {
        match &self.source {
            MediaSource::Inline { data } => Some(data.len()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    /// Base64-decoded bytes carried directly in the message.
    Inline { data: Vec<u8> },
    /// A path on a filesystem local to wherever the pipeline runs.
    File { path: String },
    /// An HTTP(S) URL the provider or consumer is expected to fetch.
    Url { url: String },
    /// A reference to a blob previously externalized by the media storage
    /// service.
    Storage(StorageReference),
}

/// An opaque pointer to externalized blob data. Created by the
/// media-externalizer stage once a provider returns media exceeding the
/// inline-size threshold; retained until an external deletion policy removes
/// it (deletion policy is explicitly out of scope — see `promptkit_core`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReference {
    pub id: String,
    pub backend: String,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolResult, ToolResultStatus};

    #[test]
    fn exactly_one_primary_content_path() {
        let m = Message::user("hi");
        assert_eq!(m.text(), "hi");
    }

    #[test]
    fn dangling_call_ids_tracks_unmatched_calls() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: serde_json::json!({}),
        };
        let history = vec![
            Message::user("what's the weather"),
            Message::assistant_with_tool_calls(None, vec![call.clone()]),
        ];
        assert_eq!(Message::dangling_call_ids(&history), vec!["call_1"]);

        let mut history = history;
        history.push(Message::tool_result(ToolResult {
            call_id: "call_1".into(),
            content: serde_json::json!({"temp": 18}),
            status: ToolResultStatus::Complete,
            pending: None,
        }));
        assert!(Message::dangling_call_ids(&history).is_empty());
    }
}
