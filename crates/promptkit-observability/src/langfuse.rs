//! Langfuse backend: batched HTTP requests against Langfuse's ingestion API
//! rather than OpenTelemetry, for direct control over the Langfuse data
//! model (trace / span / generation).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{ObservabilityBackend, ObservabilityError, ObservabilityEvent};
use crate::config::LangfuseConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum LangfuseIngestionEvent {
    TraceCreate(TraceCreateBody),
    SpanCreate(SpanCreateBody),
    SpanUpdate(SpanUpdateBody),
    GenerationCreate(GenerationCreateBody),
    GenerationUpdate(GenerationUpdateBody),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceCreateBody {
    id: String,
    timestamp: DateTime<Utc>,
    name: Option<String>,
    session_id: Option<String>,
    release: Option<String>,
    version: Option<String>,
    metadata: Option<serde_json::Value>,
    tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanCreateBody {
    id: String,
    trace_id: String,
    parent_observation_id: Option<String>,
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
    level: Option<String>,
    status_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanUpdateBody {
    id: String,
    trace_id: String,
    end_time: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
    level: Option<String>,
    status_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationCreateBody {
    id: String,
    trace_id: String,
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    model: Option<String>,
    usage: Option<UsageBody>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationUpdateBody {
    id: String,
    trace_id: String,
    end_time: Option<DateTime<Utc>>,
    model: Option<String>,
    usage: Option<UsageBody>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageBody {
    input: Option<i64>,
    output: Option<i64>,
    total: Option<i64>,
    unit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct IngestionBatch {
    batch: Vec<BatchItem>,
    metadata: Option<BatchMetadata>,
}

#[derive(Debug, Clone, Serialize)]
struct BatchItem {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    body: LangfuseIngestionEvent,
}

#[derive(Debug, Clone, Serialize)]
struct BatchMetadata {
    sdk_name: String,
    sdk_version: String,
    public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct IngestionResponse {
    #[allow(dead_code)]
    successes: Vec<SuccessItem>,
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct SuccessItem {
    id: String,
    status: i32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorItem {
    id: String,
    status: i32,
    message: Option<String>,
    error: Option<String>,
}

pub struct LangfuseBackend {
    config: LangfuseConfig,
    client: Client,
    batch: Arc<Mutex<Vec<BatchItem>>>,
}

impl LangfuseBackend {
    pub fn new(config: LangfuseConfig) -> Result<Self, ObservabilityError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ObservabilityError::Config(e.to_string()))?;

        Ok(Self {
            config,
            client,
            batch: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn from_env() -> Result<Option<Self>, ObservabilityError> {
        match LangfuseConfig::from_env() {
            Some(config) => Ok(Some(Self::new(config)?)),
            None => Ok(None),
        }
    }

    async fn add_to_batch(&self, event: LangfuseIngestionEvent) {
        let item = BatchItem {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            body: event,
        };

        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.push(item);
            batch.len() >= self.config.max_batch_size
        };

        if should_flush {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "failed to auto-flush langfuse batch");
            }
        }
    }

    async fn send_batch(&self, items: Vec<BatchItem>) -> Result<(), ObservabilityError> {
        if items.is_empty() {
            return Ok(());
        }

        let batch = IngestionBatch {
            batch: items,
            metadata: Some(BatchMetadata {
                sdk_name: "promptkit-observability".to_string(),
                sdk_version: env!("CARGO_PKG_VERSION").to_string(),
                public_key: self.config.public_key.clone(),
            }),
        };

        let url = format!("{}/api/public/ingestion", self.config.host.trim_end_matches('/'));
        debug!(url = %url, batch_size = batch.batch.len(), "sending batch to langfuse");

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.config.auth_header())
            .header("Content-Type", "application/json")
            .json(&batch)
            .send()
            .await
            .map_err(|e| ObservabilityError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            error!(status = %status, body = %body, "langfuse ingestion failed");
            return Err(ObservabilityError::Export(format!("HTTP {}: {}", status, body)));
        }

        let result: IngestionResponse = response
            .json()
            .await
            .map_err(|e| ObservabilityError::Serialization(e.to_string()))?;

        for err in &result.errors {
            warn!(id = %err.id, status = err.status, message = ?err.message, error = ?err.error, "langfuse ingestion error");
        }
        debug!(successes = result.successes.len(), errors = result.errors.len(), "langfuse batch sent");
        Ok(())
    }

    fn convert_event(&self, event: &ObservabilityEvent) -> Vec<LangfuseIngestionEvent> {
        match event {
            ObservabilityEvent::TraceStarted {
                trace_id,
                run_id,
                conversation_id,
                timestamp,
            } => vec![LangfuseIngestionEvent::TraceCreate(TraceCreateBody {
                id: trace_id.clone(),
                timestamp: *timestamp,
                name: Some(format!("run {}", run_id)),
                session_id: Some(conversation_id.to_string()),
                release: self.config.release.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
                metadata: None,
                tags: Some(vec!["promptkit".to_string()]),
            })],

            ObservabilityEvent::TraceCompleted {
                trace_id,
                success,
                error,
                total_cost_usd,
                total_tokens,
                timestamp,
                ..
            } => vec![LangfuseIngestionEvent::SpanCreate(SpanCreateBody {
                id: format!("{}-completion", trace_id),
                trace_id: trace_id.clone(),
                parent_observation_id: None,
                name: if *success { "run.completed".to_string() } else { "run.failed".to_string() },
                start_time: *timestamp,
                end_time: Some(*timestamp),
                metadata: Some(serde_json::json!({
                    "total_cost_usd": total_cost_usd,
                    "total_tokens": total_tokens,
                })),
                level: Some(if *success { "DEFAULT".to_string() } else { "ERROR".to_string() }),
                status_message: error.clone(),
            })],

            ObservabilityEvent::GenerationStarted {
                trace_id,
                span_id,
                round,
                model,
                timestamp,
                ..
            } => vec![LangfuseIngestionEvent::GenerationCreate(GenerationCreateBody {
                id: span_id.clone(),
                trace_id: trace_id.clone(),
                name: format!("provider call (round {})", round),
                start_time: *timestamp,
                end_time: None,
                model: model.clone(),
                usage: None,
                metadata: Some(serde_json::json!({ "round": round })),
            })],

            ObservabilityEvent::GenerationCompleted {
                trace_id,
                span_id,
                round,
                model,
                input_tokens,
                output_tokens,
                finish_reason,
                timestamp,
                ..
            } => {
                let usage = if input_tokens.is_some() || output_tokens.is_some() {
                    Some(UsageBody {
                        input: input_tokens.map(|t| t as i64),
                        output: output_tokens.map(|t| t as i64),
                        total: match (input_tokens, output_tokens) {
                            (Some(i), Some(o)) => Some((i + o) as i64),
                            _ => None,
                        },
                        unit: Some("TOKENS".to_string()),
                    })
                } else {
                    None
                };

                vec![LangfuseIngestionEvent::GenerationUpdate(GenerationUpdateBody {
                    id: span_id.clone(),
                    trace_id: trace_id.clone(),
                    end_time: Some(*timestamp),
                    model: model.clone(),
                    usage,
                    metadata: Some(serde_json::json!({ "round": round, "finish_reason": finish_reason })),
                })]
            }

            ObservabilityEvent::ToolStarted {
                trace_id,
                span_id,
                parent_span_id,
                call_id,
                tool_name,
                timestamp,
                ..
            } => vec![LangfuseIngestionEvent::SpanCreate(SpanCreateBody {
                id: span_id.clone(),
                trace_id: trace_id.clone(),
                parent_observation_id: parent_span_id.clone(),
                name: format!("tool:{}", tool_name),
                start_time: *timestamp,
                end_time: None,
                metadata: Some(serde_json::json!({ "call_id": call_id, "tool_name": tool_name })),
                level: None,
                status_message: None,
            })],

            ObservabilityEvent::ToolCompleted {
                trace_id,
                span_id,
                call_id,
                tool_name,
                success,
                error,
                duration_ms,
                timestamp,
                ..
            } => vec![LangfuseIngestionEvent::SpanUpdate(SpanUpdateBody {
                id: span_id.clone(),
                trace_id: trace_id.clone(),
                end_time: Some(*timestamp),
                metadata: Some(serde_json::json!({
                    "call_id": call_id,
                    "tool_name": tool_name,
                    "success": success,
                    "duration_ms": duration_ms,
                })),
                level: Some(if *success { "DEFAULT".to_string() } else { "ERROR".to_string() }),
                status_message: error.clone(),
            })],
        }
    }
}

#[async_trait]
impl ObservabilityBackend for LangfuseBackend {
    fn name(&self) -> &'static str {
        "langfuse"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn record(&self, event: ObservabilityEvent) -> Result<(), ObservabilityError> {
        for lf_event in self.convert_event(&event) {
            self.add_to_batch(lf_event).await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ObservabilityError> {
        let items = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if items.is_empty() {
            return Ok(());
        }
        info!(batch_size = items.len(), "flushing langfuse batch");
        self.send_batch(items).await
    }

    async fn shutdown(&self) -> Result<(), ObservabilityError> {
        self.flush().await?;
        info!("langfuse backend shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_config() -> LangfuseConfig {
        LangfuseConfig {
            public_key: "pk-lf-test".to_string(),
            secret_key: "sk-lf-test".to_string(),
            host: "https://cloud.langfuse.com".to_string(),
            release: Some("test-release".to_string()),
            flush_interval_ms: 5000,
            max_batch_size: 10,
        }
    }

    #[test]
    fn trace_started_converts_to_trace_create() {
        let backend = LangfuseBackend::new(test_config()).unwrap();
        let event = ObservabilityEvent::TraceStarted {
            trace_id: "trace-1".to_string(),
            run_id: Uuid::now_v7(),
            conversation_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        };

        let events = backend.convert_event(&event);
        assert_eq!(events.len(), 1);
        match &events[0] {
            LangfuseIngestionEvent::TraceCreate(body) => assert_eq!(body.id, "trace-1"),
            other => panic!("expected TraceCreate, got {other:?}"),
        }
    }

    #[test]
    fn generation_completed_carries_usage() {
        let backend = LangfuseBackend::new(test_config()).unwrap();
        let event = ObservabilityEvent::GenerationCompleted {
            trace_id: "trace-1".to_string(),
            span_id: "gen-1".to_string(),
            run_id: Uuid::now_v7(),
            round: 0,
            model: Some("gpt-4".to_string()),
            input_tokens: Some(100),
            output_tokens: Some(50),
            finish_reason: Some("stop".to_string()),
            timestamp: Utc::now(),
        };

        let events = backend.convert_event(&event);
        match &events[0] {
            LangfuseIngestionEvent::GenerationUpdate(body) => {
                let usage = body.usage.as_ref().unwrap();
                assert_eq!(usage.input, Some(100));
                assert_eq!(usage.output, Some(50));
                assert_eq!(usage.total, Some(150));
            }
            other => panic!("expected GenerationUpdate, got {other:?}"),
        }
    }

    #[test]
    fn tool_started_names_the_span_after_the_tool() {
        let backend = LangfuseBackend::new(test_config()).unwrap();
        let event = ObservabilityEvent::ToolStarted {
            trace_id: "trace-1".to_string(),
            span_id: "tool-span-1".to_string(),
            parent_span_id: Some("gen-1".to_string()),
            run_id: Uuid::now_v7(),
            call_id: "call-1".to_string(),
            tool_name: "get_weather".to_string(),
            timestamp: Utc::now(),
        };

        let events = backend.convert_event(&event);
        match &events[0] {
            LangfuseIngestionEvent::SpanCreate(body) => {
                assert_eq!(body.name, "tool:get_weather");
                assert_eq!(body.parent_observation_id, Some("gen-1".to_string()));
            }
            other => panic!("expected SpanCreate, got {other:?}"),
        }
    }
}
