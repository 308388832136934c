//! OpenAI-compatible chat completions adapter.
//!
//! Serves OpenAI itself and any server speaking the same API (Routstr,
//! OpenRouter, vLLM, LM Studio, Ollama's `/v1` endpoint).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::sse::SseDecoder;
use super::{
    parse_retry_after, ChunkStream, Completion, ProviderAdapter, ProviderError, StreamChunk,
    TokenUsage,
};
use crate::config::{ApiKey, ProviderConfig};
use crate::registry::ModelDescriptor;
use crate::router::{GenerationRequest, Role};

/// Chat completion request body.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Options controlling streaming response behavior.
#[derive(Debug, Serialize)]
struct StreamOptions {
    /// When true, the final streaming chunk includes a usage object.
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

/// Streaming chunk.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Adapter for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: Option<ApiKey>,
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
            timeout: config.timeout(),
        }
    }

    fn body<'a>(
        model: &'a ModelDescriptor,
        request: &'a GenerationRequest,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &model.id,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: role_str(m.role),
                    content: &m.content,
                })
                .collect(),
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_tokens,
            stop: request.sampling.stop.as_deref(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Send the request and turn non-2xx responses into classified errors.
    async fn send(
        &self,
        body: &ChatCompletionRequest<'_>,
        whole_request_timeout: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if whole_request_timeout {
            builder = builder.timeout(self.timeout);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        // Streaming bodies may legitimately outlive the timeout, so only the
        // wait for response headers is bounded there.
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
            tracing::debug!(
                provider = %self.name,
                status = %status,
                body = %error_body,
                "Provider returned error"
            );
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
impl ProviderAdapter for OpenAiAdapter {
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

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, &e))?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::server(format!(
                "Provider '{}' returned no choices for model '{}'",
                self.name, model.id
            ))
        })?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(TokenUsage::from),
            finish_reason: choice.finish_reason,
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
        // `None` marks end of body so the decoder can flush a final event.
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
                    .filter(|event| !event.is_done())
                    .filter_map(|event| parse_chunk(&event.data))
                    .collect::<Vec<_>>()
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }
}

/// Parse one `data:` payload. Malformed and empty chunks are skipped.
fn parse_chunk(data: &str) -> Option<Result<StreamChunk, ProviderError>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed stream chunk");
            return None;
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("stream error")
            .to_string();
        return Some(Err(ProviderError::server(message)));
    }

    let chunk: ChatCompletionChunk = serde_json::from_value(value).ok()?;
    let mut out = StreamChunk {
        usage: chunk.usage.map(TokenUsage::from),
        ..StreamChunk::default()
    };
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            out.text.push_str(&content);
        }
        if choice.finish_reason.is_some() {
            out.finish_reason = choice.finish_reason;
        }
    }

    if out.text.is_empty() && out.usage.is_none() && out.finish_reason.is_none() {
        return None;
    }
    Some(Ok(out))
}
