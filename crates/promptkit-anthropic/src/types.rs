//! Anthropic Messages API wire format and the conversions to/from
//! `promptkit-contracts` types.
//!
//! Unlike OpenAI's chat-completions shape, system prompts are a top-level
//! request field rather than a leading message, and content is always a
//! block array (text / tool_use / tool_result) rather than a plain string.

use promptkit_contracts::{Message, Role, ToolCall, ToolDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicErrorResponse {
    pub error: AnthropicErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Streaming event payloads, one per SSE `event:`/`data:` pair. Anthropic
/// names its events (`message_start`, `content_block_delta`, ...) rather than
/// relying on a `[DONE]` sentinel the way OpenAI does.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaPayload,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicErrorDetail,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessageStart {
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeltaPayload {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        // System prompts never reach here; they are lifted into the
        // request's top-level `system` field by `split_system_prompt`.
        Role::System => "user",
    }
}

/// Anthropic has no `system` role message; pull the leading system message
/// (if any) out of the history and return it alongside the remaining
/// messages converted to wire blocks.
pub fn split_system_prompt(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = None;
    let mut rest = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System && system.is_none() {
            system = Some(message.text());
            continue;
        }
        rest.push(message_to_anthropic(message));
    }
    (system, rest)
}

fn message_to_anthropic(message: &Message) -> AnthropicMessage {
    let content = if message.role == Role::Tool {
        let result = message
            .tool_result
            .as_ref()
            .expect("tool-role message always carries a tool_result");
        vec![ContentBlock::ToolResult {
            tool_use_id: result.call_id.clone(),
            content: result.content.to_string(),
            is_error: matches!(result.status, promptkit_contracts::ToolResultStatus::Failed).then_some(true),
        }]
    } else {
        let mut blocks = Vec::new();
        let text = message.text();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
        for call in &message.tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }
        blocks
    };
    AnthropicMessage {
        role: role_to_wire(message.role).to_string(),
        content,
    }
}

pub fn tool_to_anthropic(tool: &ToolDescriptor) -> AnthropicTool {
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

/// Collapses a completed response's content blocks into the text and tool
/// calls a `Message::assistant_with_tool_calls` needs.
pub fn content_blocks_to_parts(blocks: Vec<ContentBlock>) -> (Option<String>, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall { id, name, arguments: input }),
            ContentBlock::ToolResult { .. } => {}
        }
    }
    (if text.is_empty() { None } else { Some(text) }, calls)
}
