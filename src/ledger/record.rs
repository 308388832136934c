//! Ledger record type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed invocation, real call or cache hit.
///
/// Immutable once written. All fields are owned so records can move into
/// spawned tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Always 0 for cache hits.
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub fallback_used: bool,
    pub streaming: bool,
}

impl LedgerRecord {
    /// Record for a paid provider call, stamped now.
    pub fn call(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
        fallback_used: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
            cost_usd,
            cache_hit: false,
            fallback_used,
            streaming: false,
        }
    }

    /// Record for a request served from cache, stamped now.
    pub fn cache_hit(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
            cost_usd: 0.0,
            cache_hit: true,
            fallback_used: false,
            streaming: false,
        }
    }

    pub fn streamed(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
