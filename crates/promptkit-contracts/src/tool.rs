use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable once registered. Execution is dispatched by `mode`; mode-specific
/// configuration is carried in the matching variant rather than a separate
/// side table, per the tagged-variant-over-heterogeneous-registry
/// recommendation for dynamic tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,

    pub mode: ExecutionMode,

    #[serde(with = "humantime_millis", default = "default_tool_timeout")]
    pub timeout: Duration,
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(30)
}

mod humantime_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Per-variant execution configuration for a `ToolDescriptor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Always returns a fixed JSON value; used in tests and examples.
    MockStatic { result: serde_json::Value },
    /// Returns a value rendered from a template against the call arguments.
    MockScripted { template: String },
    /// An HTTP request, with headers allowed to reference environment
    /// variables (`${VAR_NAME}`) resolved at dispatch time.
    Http {
        method: String,
        url_template: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body_template: Option<String>,
    },
    /// An MCP server reached over stdio, speaking `initialize` / `tools/list`
    /// / `tools/call` JSON-RPC.
    Mcp {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Dispatched to a function registered in-process by name.
    InProcessHandler { handler_key: String },
}

/// A tool invocation emitted by the provider. `arguments` is kept as parsed
/// JSON rather than raw bytes — every provider adapter in this workspace
/// already parses the wire format before handing the call back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The result of dispatching a `ToolCall`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: serde_json::Value,
    pub status: ToolResultStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Complete,
    Pending,
    Failed,
}

/// Metadata attached to a `Pending` result so the conversation can expose the
/// call for external resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMeta {
    pub reason: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_round_trips_through_json() {
        let mode = ExecutionMode::Http {
            method: "GET".into(),
            url_template: "https://example.com/{city}".into(),
            headers: vec![("Authorization".into(), "${API_KEY}".into())],
            body_template: None,
        };
        let json = serde_json::to_string(&mode).unwrap();
        let back: ExecutionMode = serde_json::from_str(&json).unwrap();
        matches!(back, ExecutionMode::Http { .. });
    }
}
