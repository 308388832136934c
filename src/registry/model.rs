//! Model descriptors and capability tiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Minimum reasoning/skill tier a request declares.
///
/// A model qualifies for a request only if its tag set contains the
/// requested capability. Tiers are not implicitly ordered: a model tagged
/// `complex` but not `simple` does not serve `simple` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Simple,
    Moderate,
    Complex,
    Coding,
    Research,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Simple,
        Capability::Moderate,
        Capability::Complex,
        Capability::Coding,
        Capability::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Simple => "simple",
            Capability::Moderate => "moderate",
            Capability::Complex => "complex",
            Capability::Coding => "coding",
            Capability::Research => "research",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Capability::Simple),
            "moderate" => Ok(Capability::Moderate),
            "complex" => Ok(Capability::Complex),
            "coding" => Ok(Capability::Coding),
            "research" => Ok(Capability::Research),
            other => Err(format!(
                "unknown capability '{}'. Supported: simple, moderate, complex, coding, research",
                other
            )),
        }
    }
}

/// An execution target in the catalog.
///
/// Descriptors are immutable once registered; the registry hands them out
/// behind `Arc` so lookups never copy or lock them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier sent to the provider (e.g. "gpt-4o").
    pub id: String,
    /// Name of the configured provider that serves this model.
    pub provider: String,
    pub capabilities: BTreeSet<Capability>,
    /// USD per 1000 input tokens.
    pub price_per_1k_input: f64,
    /// USD per 1000 output tokens.
    pub price_per_1k_output: f64,
    pub max_context_tokens: u32,
    pub supports_streaming: bool,
    pub is_local: bool,
}

impl ModelDescriptor {
    /// Build a descriptor with streaming enabled and remote placement.
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        price_per_1k_input: f64,
        price_per_1k_output: f64,
        max_context_tokens: u32,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            capabilities: capabilities.into_iter().collect(),
            price_per_1k_input,
            price_per_1k_output,
            max_context_tokens,
            supports_streaming: true,
            is_local: false,
        }
    }

    pub fn with_streaming(mut self, supports_streaming: bool) -> Self {
        self.supports_streaming = supports_streaming;
        self
    }

    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Selection key: input + output price per 1k tokens.
    pub fn combined_price(&self) -> f64 {
        self.price_per_1k_input + self.price_per_1k_output
    }

    /// Cost in USD of a call with the given token counts.
    pub fn cost_usd(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        input_tokens as f64 / 1000.0 * self.price_per_1k_input
            + output_tokens as f64 / 1000.0 * self.price_per_1k_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!(" CODING ".parse::<Capability>().unwrap(), Capability::Coding);
        assert!("expert".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_serde_snake_case() {
        let json = serde_json::to_string(&Capability::Research).unwrap();
        assert_eq!(json, "\"research\"");
        let cap: Capability = serde_json::from_str("\"moderate\"").unwrap();
        assert_eq!(cap, Capability::Moderate);
    }

    #[test]
    fn test_cost_usd() {
        let model = ModelDescriptor::new(
            "gpt-4o",
            "openai",
            [Capability::Complex],
            0.0025,
            0.01,
            128_000,
        );
        // 2000 in * 0.0025/1k + 500 out * 0.01/1k
        let cost = model.cost_usd(2000, 500);
        assert!((cost - 0.01).abs() < 1e-12);
        assert_eq!(model.cost_usd(0, 0), 0.0);
    }

    #[test]
    fn test_supports() {
        let model = ModelDescriptor::new(
            "gpt-3.5",
            "openai",
            [Capability::Simple, Capability::Moderate],
            0.0005,
            0.0015,
            16_385,
        );
        assert!(model.supports(Capability::Simple));
        assert!(!model.supports(Capability::Complex));
        assert!((model.combined_price() - 0.002).abs() < 1e-12);
    }
}
