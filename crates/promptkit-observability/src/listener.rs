//! `EventListener` that turns `promptkit_core::event_bus::Event`s into
//! `ObservabilityEvent`s and forwards them to every configured backend.
//! Plays the role the teacher's `ObservableEventEmitter` plays wrapping an
//! `EventEmitter`, adapted to `promptkit-core`'s subscribe/publish `EventBus`
//! instead of a single wrapped emitter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use promptkit_contracts::{event_types, EventPayload};
use promptkit_core::event_bus::{Event, EventListener};
use tracing::warn;
use uuid::Uuid;

use crate::backend::{ObservabilityBackend, ObservabilityEvent};

#[derive(Debug, Clone)]
struct TraceState {
    trace_id: String,
    conversation_id: Uuid,
    current_span_id: Option<String>,
    span_started_at: Option<Instant>,
    active_tool_spans: HashMap<String, ToolSpanState>,
}

#[derive(Debug, Clone)]
struct ToolSpanState {
    span_id: String,
    parent_span_id: Option<String>,
    started_at: Instant,
}

pub struct ObservabilityListener {
    backends: Vec<Arc<dyn ObservabilityBackend>>,
    traces: tokio::sync::RwLock<HashMap<Uuid, TraceState>>,
}

impl ObservabilityListener {
    pub fn new(backends: Vec<Arc<dyn ObservabilityBackend>>) -> Self {
        Self {
            backends,
            traces: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn dispatch(&self, event: ObservabilityEvent) {
        for backend in &self.backends {
            if !backend.is_enabled() {
                continue;
            }
            if let Err(e) = backend.record(event.clone()).await {
                warn!(backend = backend.name(), error = %e, "failed to record observability event");
            }
        }
    }

    pub async fn flush(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.flush().await {
                warn!(backend = backend.name(), error = %e, "failed to flush observability backend");
            }
        }
    }

    pub async fn shutdown(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.shutdown().await {
                warn!(backend = backend.name(), error = %e, "failed to shut down observability backend");
            }
        }
    }

    async fn convert(&self, event: &Event) -> Vec<ObservabilityEvent> {
        let Ok(payload) = serde_json::from_value::<EventPayload>(event.payload.clone()) else {
            return vec![];
        };

        match (event.event_type.as_str(), payload) {
            (event_types::PIPELINE_STARTED, EventPayload::PipelineStarted { run_id }) => {
                let trace_id = Uuid::now_v7().to_string();
                let state = TraceState {
                    trace_id: trace_id.clone(),
                    conversation_id: event.conversation_id,
                    current_span_id: None,
                    span_started_at: None,
                    active_tool_spans: HashMap::new(),
                };
                self.traces.write().await.insert(run_id, state);

                vec![ObservabilityEvent::TraceStarted {
                    trace_id,
                    run_id,
                    conversation_id: event.conversation_id,
                    timestamp: event.ts,
                }]
            }

            (
                event_types::PIPELINE_COMPLETED,
                EventPayload::PipelineCompleted {
                    run_id,
                    total_cost_usd,
                    total_tokens,
                },
            ) => {
                let Some(state) = self.traces.write().await.remove(&run_id) else { return vec![] };
                vec![ObservabilityEvent::TraceCompleted {
                    trace_id: state.trace_id,
                    run_id,
                    success: true,
                    error: None,
                    total_cost_usd: Some(total_cost_usd),
                    total_tokens: Some(total_tokens),
                    timestamp: event.ts,
                }]
            }

            (event_types::PIPELINE_FAILED, EventPayload::PipelineFailed { run_id, error }) => {
                let Some(state) = self.traces.write().await.remove(&run_id) else { return vec![] };
                vec![ObservabilityEvent::TraceCompleted {
                    trace_id: state.trace_id,
                    run_id,
                    success: false,
                    error: Some(error),
                    total_cost_usd: None,
                    total_tokens: None,
                    timestamp: event.ts,
                }]
            }

            (event_types::PIPELINE_CANCELLED, EventPayload::PipelineCancelled { run_id }) => {
                let Some(state) = self.traces.write().await.remove(&run_id) else { return vec![] };
                vec![ObservabilityEvent::TraceCompleted {
                    trace_id: state.trace_id,
                    run_id,
                    success: false,
                    error: Some("cancelled".to_string()),
                    total_cost_usd: None,
                    total_tokens: None,
                    timestamp: event.ts,
                }]
            }

            (
                event_types::PROVIDER_CALL_STARTED,
                EventPayload::ProviderCallStarted { model_id, round, .. },
            ) => {
                let span_id = Uuid::now_v7().to_string();
                let trace_id = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    state.current_span_id = Some(span_id.clone());
                    state.span_started_at = Some(Instant::now());
                    state.trace_id.clone()
                };

                vec![ObservabilityEvent::GenerationStarted {
                    trace_id,
                    span_id,
                    run_id: event.run_id,
                    round,
                    model: Some(model_id),
                    timestamp: event.ts,
                }]
            }

            (
                event_types::PROVIDER_CALL_COMPLETED,
                EventPayload::ProviderCallCompleted {
                    model_id,
                    round,
                    input_tokens,
                    output_tokens,
                    finish_reason,
                    ..
                },
            ) => {
                let span_info = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    let span_id = state.current_span_id.take();
                    state.span_started_at = None;
                    span_id.map(|span_id| (state.trace_id.clone(), span_id))
                };
                let Some((trace_id, span_id)) = span_info else { return vec![] };

                vec![ObservabilityEvent::GenerationCompleted {
                    trace_id,
                    span_id,
                    run_id: event.run_id,
                    round,
                    model: Some(model_id),
                    input_tokens: Some(input_tokens),
                    output_tokens: Some(output_tokens),
                    finish_reason: Some(finish_reason),
                    timestamp: event.ts,
                }]
            }

            (event_types::PROVIDER_CALL_FAILED, EventPayload::ProviderCallFailed { model_id, round, .. }) => {
                let span_info = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    let span_id = state.current_span_id.take();
                    state.span_started_at = None;
                    span_id.map(|span_id| (state.trace_id.clone(), span_id))
                };
                let Some((trace_id, span_id)) = span_info else { return vec![] };

                vec![ObservabilityEvent::GenerationCompleted {
                    trace_id,
                    span_id,
                    run_id: event.run_id,
                    round,
                    model: Some(model_id),
                    input_tokens: None,
                    output_tokens: None,
                    finish_reason: Some("error".to_string()),
                    timestamp: event.ts,
                }]
            }

            (event_types::TOOL_CALL_STARTED, EventPayload::ToolCallStarted { call_id, name }) => {
                let span_id = Uuid::now_v7().to_string();
                let trace_info = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    let parent_span_id = state.current_span_id.clone();
                    state.active_tool_spans.insert(
                        call_id.clone(),
                        ToolSpanState {
                            span_id: span_id.clone(),
                            parent_span_id: parent_span_id.clone(),
                            started_at: Instant::now(),
                        },
                    );
                    (state.trace_id.clone(), parent_span_id)
                };

                vec![ObservabilityEvent::ToolStarted {
                    trace_id: trace_info.0,
                    span_id,
                    parent_span_id: trace_info.1,
                    run_id: event.run_id,
                    call_id,
                    tool_name: name,
                    timestamp: event.ts,
                }]
            }

            (
                event_types::TOOL_CALL_COMPLETED,
                EventPayload::ToolCallCompleted { call_id, name, .. },
            ) => {
                let span_info = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    let trace_id = state.trace_id.clone();
                    state.active_tool_spans.remove(&call_id).map(|s| (trace_id, s))
                };
                let Some((trace_id, span)) = span_info else { return vec![] };

                vec![ObservabilityEvent::ToolCompleted {
                    trace_id,
                    span_id: span.span_id,
                    parent_span_id: span.parent_span_id,
                    run_id: event.run_id,
                    call_id,
                    tool_name: name,
                    success: true,
                    error: None,
                    duration_ms: Some(span.started_at.elapsed().as_millis() as u64),
                    timestamp: event.ts,
                }]
            }

            (event_types::TOOL_CALL_FAILED, EventPayload::ToolCallFailed { call_id, name, error }) => {
                let span_info = {
                    let mut traces = self.traces.write().await;
                    let Some(state) = traces.get_mut(&event.run_id) else { return vec![] };
                    let trace_id = state.trace_id.clone();
                    state.active_tool_spans.remove(&call_id).map(|s| (trace_id, s))
                };
                let Some((trace_id, span)) = span_info else { return vec![] };

                vec![ObservabilityEvent::ToolCompleted {
                    trace_id,
                    span_id: span.span_id,
                    parent_span_id: span.parent_span_id,
                    run_id: event.run_id,
                    call_id,
                    tool_name: name,
                    success: false,
                    error: Some(error),
                    duration_ms: Some(span.started_at.elapsed().as_millis() as u64),
                    timestamp: event.ts,
                }]
            }

            _ => vec![],
        }
    }
}

#[async_trait]
impl EventListener for ObservabilityListener {
    async fn on_event(&self, event: &Event) {
        for obs_event in self.convert(event).await {
            self.dispatch(obs_event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoopBackend;
    use promptkit_core::event_bus::Event;

    fn pipeline_started(run_id: Uuid, conversation_id: Uuid) -> Event {
        Event::new(
            event_types::PIPELINE_STARTED,
            run_id,
            conversation_id,
            EventPayload::PipelineStarted { run_id },
        )
    }

    #[tokio::test]
    async fn pipeline_started_opens_a_trace() {
        let listener = ObservabilityListener::new(vec![Arc::new(NoopBackend)]);
        let run_id = Uuid::now_v7();
        let conversation_id = Uuid::now_v7();

        listener.on_event(&pipeline_started(run_id, conversation_id)).await;

        assert!(listener.traces.read().await.contains_key(&run_id));
    }

    #[tokio::test]
    async fn pipeline_completed_closes_the_trace() {
        let listener = ObservabilityListener::new(vec![Arc::new(NoopBackend)]);
        let run_id = Uuid::now_v7();
        let conversation_id = Uuid::now_v7();

        listener.on_event(&pipeline_started(run_id, conversation_id)).await;
        listener
            .on_event(&Event::new(
                event_types::PIPELINE_COMPLETED,
                run_id,
                conversation_id,
                EventPayload::PipelineCompleted {
                    run_id,
                    total_cost_usd: 0.01,
                    total_tokens: 42,
                },
            ))
            .await;

        assert!(!listener.traces.read().await.contains_key(&run_id));
    }

    #[tokio::test]
    async fn tool_call_without_a_trace_is_ignored() {
        let listener = ObservabilityListener::new(vec![Arc::new(NoopBackend)]);
        let run_id = Uuid::now_v7();
        let conversation_id = Uuid::now_v7();

        let events = listener
            .convert(&Event::new(
                event_types::TOOL_CALL_STARTED,
                run_id,
                conversation_id,
                EventPayload::ToolCallStarted {
                    call_id: "call-1".to_string(),
                    name: "get_weather".to_string(),
                },
            ))
            .await;

        assert!(events.is_empty());
    }
}
