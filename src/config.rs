//! Configuration parsing and validation for costroute.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::ledger::{BudgetMode, BudgetPeriod};
use crate::registry::{Capability, ModelDescriptor};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Routing loop parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Distinct models tried per request before giving up.
    #[serde(default = "default_max_models")]
    pub max_models: usize,
    /// Same-model retries after a retryable failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on one provider call, including body download.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Requests in flight at once within a batch.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Text served by `route_or_static` when every model is exhausted.
    #[serde(default)]
    pub fallback_response: Option<String>,
}

fn default_max_models() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_batch_concurrency() -> usize {
    8
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_models: default_max_models(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            batch_concurrency: default_batch_concurrency(),
            fallback_response: None,
        }
    }
}

impl RouterConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Default time-to-live for cached responses.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Spend limit configuration. No limit means no budget evaluation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub limit_usd: Option<f64>,
    #[serde(default)]
    pub mode: BudgetMode,
    #[serde(default)]
    pub period: BudgetPeriod,
}

/// Per-model health tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failed requests before a model is skipped.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long a tripped model is skipped before a trial request is allowed.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config
    Literal,
    /// Contained ${VAR} references expanded from the environment
    EnvExpanded,
    /// Found in the convention env var (holds the var name)
    Convention(String),
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions`.
    #[default]
    OpenAi,
    /// Anthropic `/messages`.
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name, referenced by `[[models]] provider`
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL (e.g., "https://api.openai.com/v1")
    pub url: String,
    pub api_key: Option<ApiKey>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: url.into(),
            api_key: None,
            timeout_secs: default_provider_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Model entry as written in `[[models]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub price_per_1k_input: f64,
    pub price_per_1k_output: f64,
    pub max_context_tokens: u32,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub is_local: bool,
}

impl ModelConfig {
    pub fn to_descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(
            self.id.clone(),
            self.provider.clone(),
            self.capabilities.iter().copied(),
            self.price_per_1k_input,
            self.price_per_1k_output,
            self.max_context_tokens,
        )
        .with_streaming(self.supports_streaming)
        .with_local(self.is_local)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_file(path.as_ref())?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Model descriptors for the registry, in config order.
    pub fn model_descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.iter().map(ModelConfig::to_descriptor).collect()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Validate cross-references and numeric bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every request will fail");
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !provider_names.contains(model.provider.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' references unknown provider '{}'",
                    model.id, model.provider
                )));
            }
            if !model_ids.insert(model.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate model id '{}'",
                    model.id
                )));
            }
            for (label, price) in [
                ("price_per_1k_input", model.price_per_1k_input),
                ("price_per_1k_output", model.price_per_1k_output),
            ] {
                if !price.is_finite() || price < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}' has invalid {}: {}",
                        model.id, label, price
                    )));
                }
            }
            if model.capabilities.is_empty() {
                tracing::warn!(model = %model.id, "Model has no capabilities and will never be selected");
            }
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::Validation(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }
        if self.router.max_models == 0 {
            return Err(ConfigError::Validation(
                "router.max_models must be at least 1".to_string(),
            ));
        }
        if self.router.batch_concurrency == 0 {
            return Err(ConfigError::Validation(
                "router.batch_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(limit) = self.budget.limit_usd {
            if !limit.is_finite() || limit < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "budget.limit_usd must be a non-negative number, got {}",
                    limit
                )));
            }
        } else if self.budget.mode != BudgetMode::Off {
            tracing::warn!(mode = %self.budget.mode, "Budget mode set without limit_usd, budget is inactive");
        }

        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Provider entry before env expansion; `api_key` may hold `${VAR}` references.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    #[serde(default)]
    kind: ProviderKind,
    url: String,
    api_key: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    timeout_secs: u64,
}

/// Configuration before env expansion.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    router: RouterConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    budget: BudgetConfig,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in `input` using `lookup`.
///
/// Fails on the first missing variable, unclosed `${`, or empty name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: "Unclosed '${' in api_key".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: String::new(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: "variable is not set".to_string(),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Convention env var for a provider's key: `COSTROUTE_<UPPER_SNAKE_NAME>_API_KEY`.
///
/// "openai-eu" becomes "COSTROUTE_OPENAI_EU_API_KEY".
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("COSTROUTE_{}_API_KEY", upper_snake)
}

impl Config {
    /// Resolve API keys using `lookup` for environment access.
    ///
    /// `${VAR}` keys are expanded, literal keys are wrapped as is, and absent
    /// keys fall back to the convention variable.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars_with(raw_key, &rp.name, &lookup)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => {
                    let var_name = convention_env_var_name(&rp.name);
                    match lookup(&var_name) {
                        Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var_name)),
                        None => (None, KeySource::None),
                    }
                }
            };

            key_sources.push((rp.name.clone(), source));
            providers.push(ProviderConfig {
                name: rp.name,
                kind: rp.kind,
                url: rp.url,
                api_key,
                timeout_secs: rp.timeout_secs,
            });
        }

        let config = Config {
            server: raw.server,
            router: raw.router,
            cache: raw.cache,
            budget: raw.budget,
            health: raw.health,
            providers,
            models: raw.models,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// [`Config::from_raw_with`] against the process environment.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Parse TOML with env expansion, then validate.
    pub fn parse_str_with_env(
        content: &str,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Load a TOML file with env expansion. Returns per-provider key sources.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_file(path.as_ref())?;
        Self::parse_str_with_env(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [server]
        listen = "0.0.0.0:9090"

        [router]
        max_models = 2
        max_retries = 1
        backoff_base_ms = 10
        fallback_response = "Service busy, try again later."

        [cache]
        capacity = 50
        ttl_secs = 60

        [budget]
        limit_usd = 1.0
        mode = "soft_warn"
        period = "daily"

        [health]
        failure_threshold = 5

        [[providers]]
        name = "openai"
        kind = "openai"
        url = "https://api.openai.com/v1"
        api_key = "sk-test-secret"

        [[providers]]
        name = "anthropic"
        kind = "anthropic"
        url = "https://api.anthropic.com/v1"
        timeout_secs = 30

        [[models]]
        id = "gpt-3.5"
        provider = "openai"
        capabilities = ["simple", "moderate"]
        price_per_1k_input = 0.0005
        price_per_1k_output = 0.0015
        max_context_tokens = 16000

        [[models]]
        id = "claude-sonnet"
        provider = "anthropic"
        capabilities = ["complex", "coding"]
        price_per_1k_input = 0.003
        price_per_1k_output = 0.015
        max_context_tokens = 200000
        supports_streaming = false

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.router.max_models, 3);
        assert_eq!(config.router.max_retries, 2);
        assert_eq!(config.router.backoff_base(), Duration::from_millis(500));
        assert_eq!(config.router.batch_concurrency, 8);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.budget.mode, BudgetMode::Off);
        assert_eq!(config.budget.period, BudgetPeriod::Total);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.cooldown(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse_str(FULL).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9090");
        assert_eq!(config.router.max_models, 2);
        assert_eq!(
            config.router.fallback_response.as_deref(),
            Some("Service busy, try again later.")
        );
        assert_eq!(config.budget.limit_usd, Some(1.0));
        assert_eq!(config.budget.mode, BudgetMode::SoftWarn);
        assert_eq!(config.budget.period, BudgetPeriod::Daily);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind, ProviderKind::Anthropic);
        assert_eq!(config.providers[1].timeout(), Duration::from_secs(30));
        assert_eq!(config.providers[0].timeout(), Duration::from_secs(60));

        let models = config.model_descriptors();
        assert_eq!(models.len(), 2);
        assert!(models[0].supports(Capability::Moderate));
        assert!(models[0].supports_streaming);
        assert!(!models[1].supports_streaming);
        assert!(!models[1].is_local);
    }

    #[test]
    fn test_model_with_unknown_provider_rejected() {
        let toml = r#"
            [[models]]
            id = "orphan"
            provider = "nowhere"
            capabilities = ["simple"]
            price_per_1k_input = 0.1
            price_per_1k_output = 0.1
            max_context_tokens = 1000
        "#;
        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("unknown provider"), "{}", err);
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let toml = r#"
            [[providers]]
            name = "p"
            url = "http://localhost"

            [[models]]
            id = "m"
            provider = "p"
            capabilities = ["simple"]
            price_per_1k_input = 0.1
            price_per_1k_output = 0.1
            max_context_tokens = 1000

            [[models]]
            id = "m"
            provider = "p"
            capabilities = ["simple"]
            price_per_1k_input = 0.2
            price_per_1k_output = 0.2
            max_context_tokens = 1000
        "#;
        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("Duplicate model id"), "{}", err);
    }

    #[test]
    fn test_negative_price_rejected() {
        let toml = r#"
            [[providers]]
            name = "p"
            url = "http://localhost"

            [[models]]
            id = "m"
            provider = "p"
            capabilities = ["simple"]
            price_per_1k_input = -0.1
            price_per_1k_output = 0.1
            max_context_tokens = 1000
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_bounds_rejected() {
        assert!(Config::parse_str("[cache]\ncapacity = 0").is_err());
        assert!(Config::parse_str("[router]\nmax_models = 0").is_err());
        assert!(Config::parse_str("[router]\nbatch_concurrency = 0").is_err());
    }

    #[test]
    fn test_invalid_budget_mode_is_parse_error() {
        let err = Config::parse_str("[budget]\nmode = \"block\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_api_key_redaction() {
        let key = ApiKey::from("super-secret-token");
        assert_eq!(format!("{:?}", key), "[REDACTED]");
        assert_eq!(format!("{}", key), "[REDACTED]");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "super-secret-token");
    }

    #[test]
    fn test_provider_config_debug_does_not_leak_key() {
        let config = Config::parse_str(FULL).unwrap();
        let debug = format!("{:?}", config.providers[0]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-test-secret"));
    }

    #[test]
    fn test_expand_multiple_vars() {
        let lookup = |name: &str| match name {
            "SCHEME" => Some("sk".to_string()),
            "TAIL" => Some("abc".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${SCHEME}-${TAIL}", "test", lookup).unwrap();
        assert_eq!(result, "sk-abc");
    }

    #[test]
    fn test_expand_no_vars_passthrough() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        assert_eq!(
            expand_env_vars_with("$NOT_A_VAR", "test", lookup).unwrap(),
            "$NOT_A_VAR"
        );
    }

    #[test]
    fn test_expand_errors() {
        let missing = expand_env_vars_with("${MISSING}", "provider-alpha", |_| None)
            .unwrap_err()
            .to_string();
        assert!(missing.contains("MISSING"));
        assert!(missing.contains("provider-alpha"));

        let unclosed = expand_env_vars_with("${OPEN", "p", |_| None)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(unclosed.contains("unclosed"));

        let empty = expand_env_vars_with("${}", "p", |_| None)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(empty.contains("empty"));
    }

    #[test]
    fn test_convention_env_var_name() {
        assert_eq!(convention_env_var_name("openai"), "COSTROUTE_OPENAI_API_KEY");
        assert_eq!(
            convention_env_var_name("openai-eu"),
            "COSTROUTE_OPENAI_EU_API_KEY"
        );
    }

    fn raw_with_key(api_key: Option<&str>) -> RawConfig {
        let mut toml = String::from("[[providers]]\nname = \"alpha\"\nurl = \"http://x\"\n");
        if let Some(key) = api_key {
            toml.push_str(&format!("api_key = \"{}\"\n", key));
        }
        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn test_from_raw_key_sources() {
        let env = |name: &str| match name {
            "ALPHA_KEY" => Some("expanded".to_string()),
            "COSTROUTE_ALPHA_API_KEY" => Some("conventional".to_string()),
            _ => None,
        };

        let (config, sources) = Config::from_raw_with(raw_with_key(Some("literal")), env).unwrap();
        assert_eq!(sources[0].1, KeySource::Literal);
        assert_eq!(config.providers[0].api_key.as_ref().unwrap().expose_secret(), "literal");

        let (config, sources) =
            Config::from_raw_with(raw_with_key(Some("${ALPHA_KEY}")), env).unwrap();
        assert_eq!(sources[0].1, KeySource::EnvExpanded);
        assert_eq!(config.providers[0].api_key.as_ref().unwrap().expose_secret(), "expanded");

        let (config, sources) = Config::from_raw_with(raw_with_key(None), env).unwrap();
        assert_eq!(
            sources[0].1,
            KeySource::Convention("COSTROUTE_ALPHA_API_KEY".to_string())
        );
        assert_eq!(
            config.providers[0].api_key.as_ref().unwrap().expose_secret(),
            "conventional"
        );

        let (config, sources) = Config::from_raw_with(raw_with_key(None), |_| None).unwrap();
        assert_eq!(sources[0].1, KeySource::None);
        assert!(config.providers[0].api_key.is_none());
    }
}
