//! `ProviderAdapter` implementation talking to the OpenAI chat-completions
//! API directly over `reqwest`, streaming via SSE with `eventsource-stream`.

use std::collections::HashMap;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::StreamExt;
use promptkit_contracts::{FinishReason, Message, StreamElement, ToolCall, ToolDescriptor};
use promptkit_core::error::{Error, Result};
use promptkit_core::traits::{CallParams, Capability, ElementStream, ProviderAdapter, ProviderResponse};

use crate::types::{
    message_to_openai, tool_call_from_wire, tool_to_openai, ChatRequest, OpenAiErrorResponse,
    OpenAiResponse, OpenAiStreamChunk,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(message_to_openai).collect(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            seed: params.seed,
            stream,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(tool_to_openai).collect())
            },
            response_format: params.response_format.clone(),
        }
    }

    async fn post(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transient("openai_request", e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<OpenAiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(Error::transient(
                    "openai_request",
                    anyhow::anyhow!("openai returned {status}: {detail}"),
                ));
            }
            return Err(Error::FatalProvider {
                provider_id: "openai".to_string(),
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ProviderResponse> {
        let request = self.build_request(messages, tools, params, false);
        let response = self.post(&request).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::transient("openai_response_decode", e.into()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::FatalProvider {
                provider_id: "openai".to_string(),
                detail: "response had no choices".to_string(),
            })?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(tool_call_from_wire)
            .collect();

        let message = if tool_calls.is_empty() {
            Message::assistant(choice.message.content.unwrap_or_default())
        } else {
            Message::assistant_with_tool_calls(choice.message.content, tool_calls)
        };

        let usage = parsed.usage.unwrap_or(crate::types::OpenAiUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            prompt_tokens_details: None,
        });

        Ok(ProviderResponse {
            message,
            model_id: parsed.model,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_tokens: usage.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0),
            raw: None,
        })
    }

    async fn chat_stream(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ElementStream> {
        let request = self.build_request(messages, tools, params, true);
        let response = self.post(&request).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut event_stream = response.bytes_stream().eventsource();
            // Tool-call deltas arrive keyed by `index`, with `arguments` split
            // across many chunks as raw JSON-string fragments; accumulate per
            // index and only parse once the round finishes.
            let mut accumulator: Vec<ToolCall> = Vec::new();
            let mut raw_args: HashMap<usize, String> = HashMap::new();

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(Err(Error::transient("openai_stream", e.into()))).await;
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: OpenAiStreamChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(Error::transient("openai_stream_decode", e.into()))).await;
                        return;
                    }
                };
                let Some(choice) = chunk.choices.into_iter().next() else { continue };

                if let Some(content) = choice.delta.content {
                    if !content.is_empty() && tx.send(Ok(StreamElement::text_delta(content))).await.is_err() {
                        return;
                    }
                }

                if let Some(deltas) = choice.delta.tool_calls {
                    for delta in deltas {
                        let idx = delta.index as usize;
                        if accumulator.len() <= idx {
                            accumulator.resize_with(idx + 1, || ToolCall {
                                id: String::new(),
                                name: String::new(),
                                arguments: serde_json::Value::Null,
                            });
                        }
                        if let Some(id) = delta.id {
                            accumulator[idx].id = id;
                        }
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                accumulator[idx].name = name;
                            }
                            if let Some(fragment) = function.arguments {
                                raw_args.entry(idx).or_default().push_str(&fragment);
                            }
                        }
                    }
                }

                if choice.finish_reason.as_deref() == Some("tool_calls") {
                    for (idx, call) in accumulator.iter_mut().enumerate() {
                        if let Some(raw) = raw_args.get(&idx) {
                            call.arguments = serde_json::from_str(raw).unwrap_or(serde_json::json!({}));
                        }
                    }
                    for call in accumulator.drain(..) {
                        if tx.send(Ok(StreamElement::ToolCall(call))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(StreamElement::Finish(FinishReason::Stop))).await;
                    return;
                }

                if choice.finish_reason.as_deref() == Some("stop") {
                    let _ = tx.send(Ok(StreamElement::Finish(FinishReason::Stop))).await;
                    return;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn duplex(&self, _input: ElementStream, _params: &CallParams) -> Result<ElementStream> {
        Err(Error::config("openai chat-completions has no native duplex-audio mode"))
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::Streaming | Capability::Tools | Capability::StructuredOutput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_parses_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": { "role": "assistant", "content": "hi there" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13 },
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("test-key", "gpt-4o-mini").with_base_url(server.uri());
        let response = provider
            .chat(&[Message::user("hello")], &[], &CallParams::default())
            .await
            .unwrap();

        assert_eq!(response.message.text(), "hi there");
        assert_eq!(response.input_tokens, 10);
        assert_eq!(response.output_tokens, 3);
    }

    #[tokio::test]
    async fn chat_maps_server_error_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("test-key", "gpt-4o-mini").with_base_url(server.uri());
        let result = provider.chat(&[Message::user("hello")], &[], &CallParams::default()).await;
        assert!(matches!(result, Err(Error::Transient { .. })));
    }

    #[tokio::test]
    async fn duplex_is_unsupported() {
        let provider = OpenAiProvider::new("test-key", "gpt-4o-mini");
        let empty: ElementStream = Box::pin(stream::empty());
        let result = provider.duplex(empty, &CallParams::default()).await;
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
