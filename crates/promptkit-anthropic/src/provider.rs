//! `ProviderAdapter` implementation talking to the Anthropic Messages API
//! directly over `reqwest`, streaming via SSE with `eventsource-stream`.

use std::collections::HashMap;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::StreamExt;
use promptkit_contracts::{FinishReason, Message, StreamElement, ToolCall, ToolDescriptor};
use promptkit_core::error::{Error, Result};
use promptkit_core::traits::{CallParams, Capability, ElementStream, ProviderAdapter, ProviderResponse};

use crate::types::{
    content_blocks_to_parts, split_system_prompt, tool_to_anthropic, AnthropicErrorResponse,
    ContentBlock, ContentDelta, MessagesRequest, MessagesResponse, StreamEvent,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams, stream: bool) -> MessagesRequest {
        let (system, messages) = split_system_prompt(messages);
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: params.max_tokens.unwrap_or(self.max_tokens),
            system,
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            stream,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(tool_to_anthropic).collect())
            },
        }
    }

    async fn post(&self, body: &MessagesRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transient("anthropic_request", e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<AnthropicErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(Error::transient(
                    "anthropic_request",
                    anyhow::anyhow!("anthropic returned {status}: {detail}"),
                ));
            }
            return Err(Error::FatalProvider {
                provider_id: "anthropic".to_string(),
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ProviderResponse> {
        let request = self.build_request(messages, tools, params, false);
        let response = self.post(&request).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::transient("anthropic_response_decode", e.into()))?;

        let (text, tool_calls) = content_blocks_to_parts(parsed.content);
        let message = if tool_calls.is_empty() {
            Message::assistant(text.unwrap_or_default())
        } else {
            Message::assistant_with_tool_calls(text, tool_calls)
        };

        Ok(ProviderResponse {
            message,
            model_id: parsed.model,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cached_tokens: parsed.usage.cache_read_input_tokens,
            raw: None,
        })
    }

    async fn chat_stream(&self, messages: &[Message], tools: &[ToolDescriptor], params: &CallParams) -> Result<ElementStream> {
        let request = self.build_request(messages, tools, params, true);
        let response = self.post(&request).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut event_stream = response.bytes_stream().eventsource();
            // Tool-use blocks stream their `input` as JSON-string fragments
            // (`input_json_delta`), keyed by block index the same way
            // OpenAI keys its tool-call deltas; accumulate per index and
            // parse once the block closes.
            let mut pending_calls: HashMap<usize, ToolCall> = HashMap::new();
            let mut raw_args: HashMap<usize, String> = HashMap::new();

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(Err(Error::transient("anthropic_stream", e.into()))).await;
                        return;
                    }
                };
                let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(_) => continue, // `ping` and unrecognized events carry no payload we need
                };

                match parsed {
                    StreamEvent::ContentBlockStart { index, content_block } => {
                        if let ContentBlock::ToolUse { id, name, .. } = content_block {
                            pending_calls.insert(index, ToolCall { id, name, arguments: serde_json::Value::Null });
                        }
                    }
                    StreamEvent::ContentBlockDelta { index, delta } => match delta {
                        ContentDelta::TextDelta { text } => {
                            if tx.send(Ok(StreamElement::text_delta(text))).await.is_err() {
                                return;
                            }
                        }
                        ContentDelta::InputJsonDelta { partial_json } => {
                            raw_args.entry(index).or_default().push_str(&partial_json);
                        }
                    },
                    StreamEvent::ContentBlockStop { index } => {
                        if let Some(mut call) = pending_calls.remove(&index) {
                            if let Some(raw) = raw_args.remove(&index) {
                                call.arguments = serde_json::from_str(&raw).unwrap_or(serde_json::json!({}));
                            }
                            if tx.send(Ok(StreamElement::ToolCall(call))).await.is_err() {
                                return;
                            }
                        }
                    }
                    StreamEvent::MessageDelta { delta, .. } => {
                        if delta.stop_reason.is_some() {
                            let _ = tx.send(Ok(StreamElement::Finish(FinishReason::Stop))).await;
                        }
                    }
                    StreamEvent::MessageStop => return,
                    StreamEvent::Error { error } => {
                        let _ = tx
                            .send(Err(Error::FatalProvider {
                                provider_id: "anthropic".to_string(),
                                detail: error.message,
                            }))
                            .await;
                        return;
                    }
                    StreamEvent::MessageStart { .. } | StreamEvent::Ping => {}
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn duplex(&self, _input: ElementStream, _params: &CallParams) -> Result<ElementStream> {
        Err(Error::config("anthropic messages api has no native duplex-audio mode"))
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::Streaming | Capability::Tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_parses_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "claude-3-5-sonnet-20241022",
                "content": [{ "type": "text", "text": "hi there" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 12, "output_tokens": 4 },
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("test-key", "claude-3-5-sonnet-20241022").with_base_url(server.uri());
        let response = provider
            .chat(&[Message::user("hello")], &[], &CallParams::default())
            .await
            .unwrap();

        assert_eq!(response.message.text(), "hi there");
        assert_eq!(response.input_tokens, 12);
    }

    #[tokio::test]
    async fn chat_maps_server_error_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("test-key", "claude-3-5-sonnet-20241022").with_base_url(server.uri());
        let result = provider.chat(&[Message::user("hello")], &[], &CallParams::default()).await;
        assert!(matches!(result, Err(Error::Transient { .. })));
    }

    #[tokio::test]
    async fn duplex_is_unsupported() {
        let provider = AnthropicProvider::new("test-key", "claude-3-5-sonnet-20241022");
        let empty: ElementStream = Box::pin(stream::empty());
        let result = provider.duplex(empty, &CallParams::default()).await;
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
