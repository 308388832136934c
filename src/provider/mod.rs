//! Provider adapters.
//!
//! Each backend implements [`ProviderAdapter`]. Adapters translate one
//! backend's wire format and failures into the shared [`Completion`],
//! [`StreamChunk`] and [`ProviderError`] shapes. They never retry or fall
//! back; that belongs to the router.

pub mod anthropic;
mod error;
pub mod openai;
pub mod sse;

pub use error::{parse_retry_after, ErrorKind, ProviderError};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::registry::ModelDescriptor;
use crate::router::GenerationRequest;

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A finished, non-streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// `None` when the provider did not report usage.
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// One piece of a streaming completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamChunk {
    pub text: String,
    /// Set on the chunk that carries final usage, if the provider reports it.
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Lazy, finite, one-shot sequence of chunks. Dropping it releases the
/// underlying connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform interface over one backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Configured provider name this adapter serves.
    fn name(&self) -> &str;

    /// Run a blocking (non-streaming) completion on `model`.
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<Completion, ProviderError>;

    /// Start a streaming completion on `model`.
    ///
    /// Errors returned here happen before the first chunk; errors inside the
    /// stream happen after streaming started.
    async fn complete_stream(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, ProviderError>;
}

/// Build the adapter for a configured provider.
///
/// Dispatch is on the closed [`ProviderKind`] set, decided once at startup.
pub fn build_adapter(config: &ProviderConfig, client: reqwest::Client) -> Arc<dyn ProviderAdapter> {
    match config.kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiAdapter::new(config, client)),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(config, client)),
    }
}

/// Rough token estimate at ~4 characters per token.
///
/// Used when a provider omits usage or a stream ends before reporting it.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars.div_ceil(4)).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
        // counts characters, not bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }
}
