//! Shared failure taxonomy for provider adapters.
//!
//! Every backend failure is classified into an [`ErrorKind`] here, at the
//! adapter boundary. Nothing past the adapter ever sees an HTTP status or a
//! `reqwest::Error`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classified provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    ServerError,
    AuthError,
    InvalidRequest,
}

impl ErrorKind {
    /// Whether the router may retry the same model or fall back to another.
    ///
    /// `AuthError` and `InvalidRequest` are terminal: the problem is the
    /// request or the credentials, not the backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::ServerError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// Statuses outside 4xx/5xx are not expected from a completion endpoint
    /// and are treated as terminal.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            408 | 504 => ErrorKind::Timeout,
            401 | 403 => ErrorKind::AuthError,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::InvalidRequest,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by an adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
    /// Server-provided hint for when to retry (`Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Build an error from a non-success HTTP response status and body.
    pub fn from_response(
        provider: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let detail = extract_error_message(body).unwrap_or_else(|| truncate(body, 200));
        Self {
            kind: ErrorKind::from_status(status),
            message: format!("Provider '{}' returned {}: {}", provider, status, detail),
            status: Some(status),
            retry_after,
        }
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(provider: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_response(provider, status.as_u16(), "", None);
        }

        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            // Unreachable backend or a truncated/malformed response body.
            ErrorKind::ServerError
        } else {
            // Builder and redirect failures: the request itself cannot be sent.
            ErrorKind::InvalidRequest
        };

        Self::new(
            kind,
            format!("Failed to reach provider '{}': {}", provider, err),
        )
    }
}

/// Parse a `Retry-After` header value given in seconds.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Pull `error.message` (OpenAI and Anthropic both use it) out of an error body.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    match error {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
