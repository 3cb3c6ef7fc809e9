//! Observability backend trait and the high-level events derived from
//! `promptkit_core::event_bus::Event`. Backends translate these into their
//! own wire format (structured log lines, Langfuse ingestion payloads, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Semantic observability events, derived from the raw `Event`/`EventPayload`
/// pairs published on the pipeline's `EventBus`. One run maps to one trace;
/// provider calls and tool calls within it map to spans under that trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObservabilityEvent {
    TraceStarted {
        trace_id: String,
        run_id: Uuid,
        conversation_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    TraceCompleted {
        trace_id: String,
        run_id: Uuid,
        success: bool,
        error: Option<String>,
        total_cost_usd: Option<f64>,
        total_tokens: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    GenerationStarted {
        trace_id: String,
        span_id: String,
        run_id: Uuid,
        round: u32,
        model: Option<String>,
        timestamp: DateTime<Utc>,
    },
    GenerationCompleted {
        trace_id: String,
        span_id: String,
        run_id: Uuid,
        round: u32,
        model: Option<String>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        finish_reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ToolStarted {
        trace_id: String,
        span_id: String,
        parent_span_id: Option<String>,
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },
    ToolCompleted {
        trace_id: String,
        span_id: String,
        parent_span_id: Option<String>,
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },
}

impl ObservabilityEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            Self::TraceStarted { trace_id, .. } => trace_id,
            Self::TraceCompleted { trace_id, .. } => trace_id,
            Self::GenerationStarted { trace_id, .. } => trace_id,
            Self::GenerationCompleted { trace_id, .. } => trace_id,
            Self::ToolStarted { trace_id, .. } => trace_id,
            Self::ToolCompleted { trace_id, .. } => trace_id,
        }
    }
}

/// Implementations translate `ObservabilityEvent`s into provider-specific
/// calls and send them to the observability platform.
#[async_trait]
pub trait ObservabilityBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    async fn record(&self, event: ObservabilityEvent) -> Result<(), ObservabilityError>;

    /// Flush any buffered events. Called on shutdown and may be called
    /// periodically by a caller-driven flush loop.
    async fn flush(&self) -> Result<(), ObservabilityError>;

    async fn shutdown(&self) -> Result<(), ObservabilityError> {
        self.flush().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Discards every event. The default when no backend is configured.
pub struct NoopBackend;

#[async_trait]
impl ObservabilityBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn record(&self, _event: ObservabilityEvent) -> Result<(), ObservabilityError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), ObservabilityError> {
        Ok(())
    }
}

/// Logs every event as a structured `tracing` event. Always available —
/// this is the ambient logging layer every deployment gets, regardless of
/// whether a Langfuse key is configured.
pub struct TracingBackend;

#[async_trait]
impl ObservabilityBackend for TracingBackend {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn record(&self, event: ObservabilityEvent) -> Result<(), ObservabilityError> {
        match &event {
            ObservabilityEvent::TraceStarted { run_id, conversation_id, .. } => {
                tracing::info!(%run_id, %conversation_id, trace_id = event.trace_id(), "run started");
            }
            ObservabilityEvent::TraceCompleted { run_id, success, error, .. } => {
                tracing::info!(%run_id, success, error = ?error, trace_id = event.trace_id(), "run completed");
            }
            ObservabilityEvent::GenerationStarted { run_id, round, model, .. } => {
                tracing::debug!(%run_id, round, model = ?model, trace_id = event.trace_id(), "provider call started");
            }
            ObservabilityEvent::GenerationCompleted {
                run_id,
                round,
                input_tokens,
                output_tokens,
                finish_reason,
                ..
            } => {
                tracing::debug!(
                    %run_id,
                    round,
                    input_tokens = ?input_tokens,
                    output_tokens = ?output_tokens,
                    finish_reason = ?finish_reason,
                    trace_id = event.trace_id(),
                    "provider call completed"
                );
            }
            ObservabilityEvent::ToolStarted { run_id, tool_name, call_id, .. } => {
                tracing::debug!(%run_id, tool_name, call_id, trace_id = event.trace_id(), "tool call started");
            }
            ObservabilityEvent::ToolCompleted {
                run_id,
                tool_name,
                call_id,
                success,
                duration_ms,
                ..
            } => {
                tracing::debug!(
                    %run_id,
                    tool_name,
                    call_id,
                    success,
                    duration_ms = ?duration_ms,
                    trace_id = event.trace_id(),
                    "tool call completed"
                );
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ObservabilityError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_accessor_covers_all_variants() {
        let event = ObservabilityEvent::TraceStarted {
            trace_id: "t1".to_string(),
            run_id: Uuid::now_v7(),
            conversation_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.trace_id(), "t1");
    }

    #[tokio::test]
    async fn noop_backend_never_errors() {
        let backend = NoopBackend;
        assert!(!backend.is_enabled());
        let event = ObservabilityEvent::TraceStarted {
            trace_id: "t1".to_string(),
            run_id: Uuid::now_v7(),
            conversation_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        };
        backend.record(event).await.unwrap();
        backend.flush().await.unwrap();
    }

    #[tokio::test]
    async fn tracing_backend_records_every_variant_without_error() {
        let backend = TracingBackend;
        let run_id = Uuid::now_v7();
        let events = vec![
            ObservabilityEvent::TraceStarted {
                trace_id: "t1".into(),
                run_id,
                conversation_id: Uuid::now_v7(),
                timestamp: Utc::now(),
            },
            ObservabilityEvent::GenerationStarted {
                trace_id: "t1".into(),
                span_id: "s1".into(),
                run_id,
                round: 0,
                model: Some("gpt-4".into()),
                timestamp: Utc::now(),
            },
            ObservabilityEvent::ToolCompleted {
                trace_id: "t1".into(),
                span_id: "s2".into(),
                parent_span_id: Some("s1".into()),
                run_id,
                call_id: "call-1".into(),
                tool_name: "get_weather".into(),
                success: true,
                error: None,
                duration_ms: Some(12),
                timestamp: Utc::now(),
            },
        ];
        for event in events {
            backend.record(event).await.unwrap();
        }
    }
}
