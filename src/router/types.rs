//! Request and result types for the router's inbound API.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ledger::BudgetMode;
use crate::provider::{estimate_tokens, ErrorKind};
use crate::registry::Capability;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the provider. Part of request identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

fn default_capability() -> Capability {
    Capability::Simple
}

/// A generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    /// Minimum capability a model must carry to serve this request.
    #[serde(default = "default_capability")]
    pub required_capability: Capability,
    /// Explicit model id; bypasses selection for the first attempt only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Per-request cap on distinct models; can only lower the router's cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fallback_models: Option<usize>,
    /// Cache TTL in seconds. `None` uses the router default, `0` bypasses the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    /// Budget policy for this call. `None` uses the router default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_mode: Option<BudgetMode>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, required_capability: Capability) -> Self {
        Self {
            messages,
            required_capability,
            model_override: None,
            max_fallback_models: None,
            cache_ttl_secs: None,
            budget_mode: None,
            sampling: SamplingParams::default(),
        }
    }

    /// Single user-message request.
    pub fn prompt(prompt: impl Into<String>, required_capability: Capability) -> Self {
        Self::new(vec![Message::user(prompt)], required_capability)
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_max_fallback_models(mut self, max: usize) -> Self {
        self.max_fallback_models = Some(max);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_budget_mode(mut self, mode: BudgetMode) -> Self {
        self.budget_mode = Some(mode);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.sampling.max_tokens = Some(max_tokens);
        self
    }

    /// Estimated prompt size, used for context-window filtering and for
    /// ledger records when the provider reports no usage.
    pub fn estimated_input_tokens(&self) -> u32 {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }
}

/// One model abandoned on the way to the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub model_attempted: String,
    pub provider: String,
    /// Kind of the last failure on this model.
    pub error_kind: ErrorKind,
    /// Calls made to this model, including same-model retries.
    pub attempts: u32,
    /// Time spent on this model, backoff included.
    pub elapsed_ms: u64,
    pub message: String,
}

/// Outcome of a routed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub text: String,
    pub model_used: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub fallback_events: Vec<FallbackEvent>,
    pub latency_ms: u64,
    /// Set in soft-warn mode when spend has crossed the budget limit.
    pub budget_exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl InvocationResult {
    /// Whether any model was abandoned before this result.
    pub fn fallback_used(&self) -> bool {
        !self.fallback_events.is_empty()
    }
}

/// Format fallback events as `"3/model-a, 1/model-b"`: calls per model,
/// in order of first appearance. `None` when no model was abandoned.
pub fn format_fallback_summary(events: &[FallbackEvent]) -> Option<String> {
    if events.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for event in events {
        if let Some(entry) = counts
            .iter_mut()
            .find(|(name, _)| *name == event.model_attempted)
        {
            entry.1 += event.attempts;
        } else {
            counts.push((&event.model_attempted, event.attempts));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}
