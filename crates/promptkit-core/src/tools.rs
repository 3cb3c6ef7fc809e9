//! Tool execution result taxonomy and the dangling-tool-call repair used by
//! the context-builder stage.

use promptkit_contracts::{Message, PendingMeta, Role, ToolResult, ToolResultStatus};

/// The outcome of dispatching a tool call, distinguishing a *tool-level*
/// failure (safe to hand back to the model so it can recover) from an
/// *internal* failure (a bug, a secret leaking into an error message, a
/// downstream outage) which must never reach the LLM verbatim.
#[derive(Debug, Clone)]
pub enum ToolExecutionResult {
    Success(serde_json::Value),
    /// The tool ran and reported a failure the model can reason about
    /// (invalid city name, file not found, ...).
    ToolError(String),
    /// Something failed that isn't safe to describe to the model. Logged in
    /// full here; only a generic message crosses into the conversation.
    InternalError(ToolInternalError),
    Pending(PendingMeta),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct ToolInternalError {
    pub detail: String,
}

impl ToolInternalError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self { detail: detail.into() }
    }
}

impl ToolExecutionResult {
    /// Converts to the wire-level `ToolResult` appended to the message
    /// history, redacting `InternalError` detail and logging it first.
    pub fn into_tool_result(self, call_id: String) -> ToolResult {
        match self {
            ToolExecutionResult::Success(value) => ToolResult {
                call_id,
                content: value,
                status: ToolResultStatus::Complete,
                pending: None,
            },
            ToolExecutionResult::ToolError(detail) => ToolResult {
                call_id,
                content: serde_json::json!({ "error": detail }),
                status: ToolResultStatus::Failed,
                pending: None,
            },
            ToolExecutionResult::InternalError(err) => {
                tracing::error!(call_id = %call_id, detail = %err.detail, "tool internal error");
                ToolResult {
                    call_id,
                    content: serde_json::json!({ "error": "tool execution failed" }),
                    status: ToolResultStatus::Failed,
                    pending: None,
                }
            }
            ToolExecutionResult::Pending(meta) => ToolResult {
                call_id,
                content: serde_json::Value::Null,
                status: ToolResultStatus::Pending,
                pending: Some(meta),
            },
        }
    }
}

/// Inserts a synthetic `cancelled` tool-result for every tool call in
/// `history` that has no matching tool-result yet. Required before the next
/// provider call whenever a turn was interrupted or cancelled mid-tool-loop,
/// since every provider's wire format requires `tool_calls` and `tool`
/// messages to line up one-to-one.
pub fn patch_dangling_tool_calls(history: &mut Vec<Message>) {
    let dangling = Message::dangling_call_ids(history);
    for call_id in dangling {
        history.push(Message::tool_result(ToolResult {
            call_id,
            content: serde_json::json!({ "status": "cancelled" }),
            status: ToolResultStatus::Failed,
            pending: None,
        }));
    }
}

/// A named bundle of tool names, optionally contributing a system-prompt
/// fragment. Purely additive sugar over `ToolRegistry`/`Pack::tools` so a
/// conversation can opt into "capabilities" (e.g. `"web_search"`) instead of
/// listing every underlying tool by name; the per-call tool policy is
/// unaffected.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    bundles: std::collections::HashMap<String, Capability>,
}

#[derive(Debug, Clone)]
pub struct Capability {
    pub tool_names: Vec<String>,
    pub prompt_fragment: Option<String>,
}

impl CapabilityRegistry {
    pub fn register(&mut self, name: impl Into<String>, capability: Capability) {
        self.bundles.insert(name.into(), capability);
    }

    /// Resolves a list of capability names into the union of tool names and
    /// concatenated prompt fragments they contribute.
    pub fn resolve(&self, names: &[String]) -> (Vec<String>, Vec<String>) {
        let mut tools = Vec::new();
        let mut fragments = Vec::new();
        for name in names {
            if let Some(capability) = self.bundles.get(name) {
                tools.extend(capability.tool_names.iter().cloned());
                if let Some(fragment) = &capability.prompt_fragment {
                    fragments.push(fragment.clone());
                }
            }
        }
        (tools, fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptkit_contracts::ToolCall;

    #[test]
    fn patches_calls_missing_results() {
        let mut history = vec![
            Message::user("book me a flight"),
            Message::assistant_with_tool_calls(
                None,
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "book_flight".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
        ];
        patch_dangling_tool_calls(&mut history);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].role, Role::Tool);
        assert!(Message::dangling_call_ids(&history).is_empty());
    }

    #[test]
    fn leaves_satisfied_calls_alone() {
        let mut history = vec![Message::user("hi")];
        patch_dangling_tool_calls(&mut history);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn internal_error_is_redacted() {
        let result = ToolExecutionResult::InternalError(ToolInternalError::new("db password leaked"));
        let tool_result = result.into_tool_result("call_1".into());
        assert_eq!(tool_result.status, ToolResultStatus::Failed);
        assert!(!tool_result.content.to_string().contains("password"));
    }
}
