//! Anthropic Messages API adapter.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::sse::{SseDecoder, SseEvent};
use super::{
    parse_retry_after, ChunkStream, Completion, ErrorKind, ProviderAdapter, ProviderError,
    StreamChunk, TokenUsage,
};
use crate::config::{ApiKey, ProviderConfig};
use crate::registry::ModelDescriptor;
use crate::router::{GenerationRequest, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API; used when the request sets none.
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Stream event payload; only the fields we route on.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Classify an Anthropic `error.type`.
fn error_kind(error_type: &str) -> ErrorKind {
    match error_type {
        "rate_limit_error" => ErrorKind::RateLimited,
        "overloaded_error" | "api_error" => ErrorKind::ServerError,
        "timeout_error" => ErrorKind::Timeout,
        "authentication_error" | "permission_error" => ErrorKind::AuthError,
        _ => ErrorKind::InvalidRequest,
    }
}

/// Adapter for Anthropic's `/messages` endpoint.
pub struct AnthropicAdapter {
    name: String,
    base_url: String,
    api_key: Option<ApiKey>,
    client: reqwest::Client,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
            timeout: config.timeout(),
        }
    }

    /// System messages move to the top-level `system` field.
    fn body<'a>(
        model: &'a ModelDescriptor,
        request: &'a GenerationRequest,
        stream: bool,
    ) -> MessagesRequest<'a> {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        MessagesRequest {
            model: &model.id,
            max_tokens: request.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| WireMessage {
                    role: if m.role == Role::Assistant {
                        "assistant"
                    } else {
                        "user"
                    },
                    content: &m.content,
                })
                .collect(),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            stop_sequences: request.sampling.stop.as_deref(),
            stream,
        }
    }

    async fn send(
        &self,
        body: &MessagesRequest<'_>,
        whole_request_timeout: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/messages", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        if whole_request_timeout {
            builder = builder.timeout(self.timeout);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| {
                ProviderError::timeout(format!(
                    "Provider '{}' did not respond within {:?}",
                    self.name, self.timeout
                ))
            })?
            .map_err(|e| ProviderError::from_reqwest(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(header::RETRY_AFTER));
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(
                &self.name,
                status.as_u16(),
                &error_body,
                retry_after,
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<Completion, ProviderError> {
        let body = Self::body(model, request, false);
        let response = self.send(&body, true).await?;

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, &e))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(Completion {
            text,
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            finish_reason: parsed.stop_reason,
        })
    }

    async fn complete_stream(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let body = Self::body(model, request, true);
        let response = self.send(&body, false).await?;

        let name = self.name.clone();
        let mut decoder = SseDecoder::new();
        let mut state = StreamState::default();
        let stream = response
            .bytes_stream()
            .map(Some)
            .chain(futures::stream::once(async { None }))
            .map(move |chunk| {
                let events = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => return vec![Err(ProviderError::from_reqwest(&name, &e))],
                    None => decoder.finish(),
                };
                events
                    .into_iter()
                    .filter_map(|event| state.on_event(&event))
                    .collect::<Vec<_>>()
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }
}

/// Per-stream accumulator: input tokens arrive in `message_start`, output
/// tokens in `message_delta`.
#[derive(Debug, Default)]
struct StreamState {
    input_tokens: u32,
}

impl StreamState {
    fn on_event(&mut self, event: &SseEvent) -> Option<Result<StreamChunk, ProviderError>> {
        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed stream event");
                return None;
            }
        };

        match parsed.event_type.as_str() {
            "message_start" => {
                if let Some(usage) = parsed.message.and_then(|m| m.usage) {
                    self.input_tokens = usage.input_tokens;
                }
                None
            }
            "content_block_delta" => {
                let text = parsed.delta.and_then(|d| d.text)?;
                Some(Ok(StreamChunk::text(text)))
            }
            "message_delta" => {
                let output_tokens = parsed.usage.map(|u| u.output_tokens).unwrap_or(0);
                Some(Ok(StreamChunk {
                    text: String::new(),
                    usage: Some(TokenUsage {
                        input_tokens: self.input_tokens,
                        output_tokens,
                    }),
                    finish_reason: parsed.delta.and_then(|d| d.stop_reason),
                }))
            }
            "error" => {
                let body = parsed.error.unwrap_or(StreamErrorBody {
                    error_type: String::new(),
                    message: "stream error".to_string(),
                });
                Some(Err(ProviderError::new(
                    error_kind(&body.error_type),
                    body.message,
                )))
            }
            // ping, content_block_start/stop, message_stop
            _ => None,
        }
    }
}
