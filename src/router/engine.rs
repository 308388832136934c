//! The routing state machine.
//!
//! `route` runs cache check, budget gate, model selection, invocation with
//! same-model retry, and fallback advance, then writes the ledger and cache.
//! `route_stream` runs the same selection and fallback up to the first chunk.
//! `route_batch` runs many `route` calls under a concurrency bound.

use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::cache::{CacheStats, CachedResponse, Fingerprint, ResponseCache};
use crate::config::{BudgetConfig, CacheConfig, Config, ConfigError, HealthConfig, RouterConfig};
use crate::error::Error;
use crate::ledger::{BudgetMode, BudgetPeriod, BudgetStatus, Ledger, LedgerRecord};
use crate::provider::{
    build_adapter, estimate_tokens, ChunkStream, ErrorKind, ProviderAdapter, ProviderError,
    StreamChunk,
};
use crate::registry::{ModelDescriptor, ModelRegistry};

use super::health::{HealthTracker, ModelHealthSnapshot};
use super::retry::{retry_model, RetryPolicy};
use super::stream::{CacheSlot, RoutedStream};
use super::{FallbackEvent, GenerationRequest, InvocationResult, RouteError};

/// Model id reported on results served by [`Router::route_or_static`].
pub const STATIC_FALLBACK_MODEL: &str = "static-fallback";

/// Parameters that can change on a live router.
#[derive(Debug, Clone)]
struct Settings {
    max_models: usize,
    default_ttl: Duration,
    cache_enabled: bool,
    budget: BudgetConfig,
    fallback_response: Option<String>,
    batch_concurrency: usize,
}

/// Current spend against the configured budget.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub limit_usd: Option<f64>,
    pub mode: BudgetMode,
    pub period: BudgetPeriod,
    pub spent_usd: f64,
    pub exceeded: bool,
}

struct Inner {
    registry: Arc<ModelRegistry>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    cache: Arc<ResponseCache>,
    ledger: Arc<Ledger>,
    health: HealthTracker,
    retry: RetryPolicy,
    settings: RwLock<Settings>,
}

/// Cost-aware router over a set of provider adapters.
///
/// Cheap to clone; clones share the registry, cache, ledger, and health
/// state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

/// Assembles a [`Router`] from parts. Used directly by tests and embedders
/// that bring their own adapters.
pub struct RouterBuilder {
    models: Vec<ModelDescriptor>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    router: RouterConfig,
    cache: CacheConfig,
    budget: BudgetConfig,
    health: HealthConfig,
    ledger: Option<Arc<Ledger>>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            adapters: HashMap::new(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            health: HealthConfig::default(),
            ledger: None,
        }
    }
}

impl RouterBuilder {
    pub fn model(mut self, model: ModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    pub fn models(mut self, models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        self.models.extend(models);
        self
    }

    /// Serve every model whose `provider` is `name` with `adapter`.
    pub fn adapter(mut self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(name.into(), adapter);
        self
    }

    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn budget_config(mut self, config: BudgetConfig) -> Self {
        self.budget = config;
        self
    }

    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    /// Share an existing ledger instead of starting an empty one.
    pub fn ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<Router, Error> {
        for model in &self.models {
            if !self.adapters.contains_key(&model.provider) {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' references provider '{}' with no adapter",
                    model.id, model.provider
                ))
                .into());
            }
        }
        let registry = ModelRegistry::from_models(self.models)?;

        let settings = Settings {
            max_models: self.router.max_models.max(1),
            default_ttl: self.cache.ttl(),
            cache_enabled: self.cache.enabled,
            budget: self.budget,
            fallback_response: self.router.fallback_response.clone(),
            batch_concurrency: self.router.batch_concurrency.max(1),
        };

        tracing::debug!(
            models = registry.len(),
            providers = self.adapters.len(),
            max_models = settings.max_models,
            "Router built"
        );

        Ok(Router {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                adapters: self.adapters,
                cache: Arc::new(ResponseCache::new(self.cache.capacity)),
                ledger: self.ledger.unwrap_or_default(),
                health: HealthTracker::new(&self.health),
                retry: RetryPolicy::from_config(&self.router),
                settings: RwLock::new(settings),
            }),
        })
    }
}

/// Outcome of driving one admitted model.
enum Attempt<T> {
    Success(T),
    /// Retryable failure after same-model retries; advance to the next model.
    Exhausted(FallbackEvent),
    Terminal(RouteError),
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Build a router from configuration, with one HTTP adapter per provider.
    ///
    /// The shared client carries no overall timeout; streaming bodies can
    /// outlive any fixed bound. Adapters and the retry policy bound attempts.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let mut builder = Router::builder()
            .models(config.model_descriptors())
            .router_config(config.router.clone())
            .cache_config(config.cache.clone())
            .budget_config(config.budget.clone())
            .health_config(config.health.clone());
        for provider in &config.providers {
            builder = builder.adapter(provider.name.clone(), build_adapter(provider, client.clone()));
        }
        builder.build()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.inner.ledger
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Sweep expired cache entries now.
    pub fn purge_expired(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    pub fn health(&self) -> Vec<ModelHealthSnapshot> {
        self.inner.health.snapshot()
    }

    fn settings(&self) -> Settings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.inner.settings.write().unwrap_or_else(|e| e.into_inner()));
    }

    /// Replace the budget limit and mode. `None` disables budget evaluation.
    pub fn set_budget(&self, limit_usd: Option<f64>, mode: BudgetMode) {
        tracing::info!(limit_usd = ?limit_usd, mode = %mode, "Budget updated");
        self.update(|s| {
            s.budget.limit_usd = limit_usd;
            s.budget.mode = mode;
        });
    }

    pub fn set_budget_period(&self, period: BudgetPeriod) {
        self.update(|s| s.budget.period = period);
    }

    /// Cap on distinct models per request. Values below 1 become 1.
    pub fn set_max_models(&self, max_models: usize) {
        self.update(|s| s.max_models = max_models.max(1));
    }

    /// TTL used when a request does not set `cache_ttl_secs`.
    pub fn set_default_ttl(&self, ttl: Duration) {
        self.update(|s| s.default_ttl = ttl);
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.update(|s| s.cache_enabled = enabled);
    }

    /// Resize the cache, evicting down to the new capacity.
    pub fn set_cache_capacity(&self, capacity: usize) {
        self.inner.cache.set_capacity(capacity);
    }

    pub fn set_batch_concurrency(&self, limit: usize) {
        self.update(|s| s.batch_concurrency = limit.max(1));
    }

    pub fn budget_report(&self) -> BudgetReport {
        let budget = self.settings().budget;
        let spent_usd = self.inner.ledger.spend(budget.period);
        let exceeded = match budget.limit_usd {
            Some(limit) => budget.mode != BudgetMode::Off && spent_usd >= limit,
            None => false,
        };
        BudgetReport {
            limit_usd: budget.limit_usd,
            mode: budget.mode,
            period: budget.period,
            spent_usd,
            exceeded,
        }
    }

    /// Evaluate spend under the request's budget mode, or the router
    /// default when the request sets none.
    fn budget_status(&self, mode: Option<BudgetMode>, settings: &Settings) -> BudgetStatus {
        let mode = mode.unwrap_or(settings.budget.mode);
        match settings.budget.limit_usd {
            Some(limit) => self
                .inner
                .ledger
                .check_budget_in(limit, mode, settings.budget.period),
            None => BudgetStatus::Ok,
        }
    }

    /// Refuse the call in hard-block mode once the limit is crossed.
    fn budget_gate(&self, request: &GenerationRequest, settings: &Settings) -> Result<(), RouteError> {
        match self.budget_status(request.budget_mode, settings) {
            BudgetStatus::Exceeded {
                spent_usd,
                limit_usd,
                should_block: true,
            } => {
                tracing::warn!(spent_usd, limit_usd, "Budget exceeded, blocking request");
                Err(RouteError::BudgetExceeded {
                    spent_usd,
                    limit_usd,
                })
            }
            _ => Ok(()),
        }
    }

    fn budget_flag(&self, mode: Option<BudgetMode>, settings: &Settings) -> bool {
        let status = self.budget_status(mode, settings);
        if let BudgetStatus::Exceeded {
            spent_usd,
            limit_usd,
            ..
        } = status
        {
            tracing::warn!(spent_usd, limit_usd, "Budget limit crossed");
        }
        status.is_exceeded()
    }

    /// Effective cache TTL, or `None` when this request bypasses the cache.
    fn cache_ttl(request: &GenerationRequest, settings: &Settings) -> Option<Duration> {
        if !settings.cache_enabled {
            return None;
        }
        let ttl = request
            .cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(settings.default_ttl);
        (!ttl.is_zero()).then_some(ttl)
    }

    fn max_models(request: &GenerationRequest, settings: &Settings) -> usize {
        request
            .max_fallback_models
            .map_or(settings.max_models, |n| n.min(settings.max_models))
            .max(1)
    }

    fn validate(&self, request: &GenerationRequest) -> Result<(), RouteError> {
        if request.messages.is_empty() {
            return Err(RouteError::InvalidRequest {
                model: None,
                message: "Request has no messages".to_string(),
            });
        }
        if let Some(id) = &request.model_override {
            if self.inner.registry.get(id).is_none() {
                return Err(RouteError::UnknownModel(id.clone()));
            }
        }
        Ok(())
    }

    /// Next candidate: the override on first use, otherwise the cheapest
    /// qualifying model not yet tried whose context window fits.
    fn next_model(
        &self,
        request: &GenerationRequest,
        pending_override: &mut Option<String>,
        excluded: &HashSet<String>,
        streaming: bool,
    ) -> Option<Arc<ModelDescriptor>> {
        if let Some(id) = pending_override.take() {
            if let Some(model) = self.inner.registry.get(&id) {
                if !streaming || model.supports_streaming {
                    return Some(model);
                }
                tracing::warn!(model = %id, "Override model does not support streaming, selecting instead");
            }
        }

        let needed = request
            .estimated_input_tokens()
            .saturating_add(request.sampling.max_tokens.unwrap_or(0));
        self.inner
            .registry
            .select_where(request.required_capability, excluded, |m| {
                m.max_context_tokens >= needed && (!streaming || m.supports_streaming)
            })
            .ok()
    }

    /// Shared selection/fallback loop. `invoke` drives one model through
    /// its retries.
    async fn run_chain<T, F, Fut>(
        &self,
        request: &GenerationRequest,
        settings: &Settings,
        streaming: bool,
        invoke: F,
    ) -> Result<(T, Arc<ModelDescriptor>, Vec<FallbackEvent>), RouteError>
    where
        F: Fn(Arc<ModelDescriptor>, Arc<dyn ProviderAdapter>) -> Fut,
        Fut: std::future::Future<Output = Attempt<T>>,
    {
        let cap = Self::max_models(request, settings);
        let mut pending_override = request.model_override.clone();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut events: Vec<FallbackEvent> = Vec::new();
        let mut tried = 0usize;
        let mut unavailable = 0usize;

        while tried < cap {
            let Some(model) = self.next_model(request, &mut pending_override, &excluded, streaming)
            else {
                break;
            };
            excluded.insert(model.id.clone());

            let Some(adapter) = self.inner.adapters.get(&model.provider).cloned() else {
                tracing::warn!(model = %model.id, provider = %model.provider, "No adapter for provider, skipping model");
                unavailable += 1;
                continue;
            };
            let Some(permit) = self.inner.health.admit(&model.id) else {
                unavailable += 1;
                continue;
            };

            tried += 1;
            tracing::info!(
                model = %model.id,
                provider = %model.provider,
                capability = %request.required_capability,
                attempt = tried,
                trial = permit.is_trial(),
                "Selected model"
            );

            match invoke(Arc::clone(&model), adapter).await {
                Attempt::Success(value) => {
                    permit.success();
                    return Ok((value, model, events));
                }
                Attempt::Terminal(err) => {
                    permit.neutral();
                    tracing::warn!(model = %model.id, kind = err.kind(), error = %err, "Terminal failure");
                    return Err(err);
                }
                Attempt::Exhausted(event) => {
                    permit.failure(event.error_kind);
                    tracing::info!(
                        model = %model.id,
                        kind = %event.error_kind,
                        attempts = event.attempts,
                        "Advancing to next model"
                    );
                    events.push(event);
                }
            }
        }

        if events.is_empty() && unavailable == 0 {
            tracing::warn!(capability = %request.required_capability, "No model available");
            Err(RouteError::NoModelAvailable {
                capability: request.required_capability,
            })
        } else {
            tracing::warn!(attempted = events.len(), unavailable, "All models exhausted");
            Err(RouteError::AllModelsExhausted {
                attempted: events,
                unavailable,
            })
        }
    }

    /// Classify the final error of one model.
    fn settle<T>(
        model: &ModelDescriptor,
        started: Instant,
        attempts: u32,
        result: Result<T, ProviderError>,
    ) -> Attempt<T> {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(err) => match err.kind {
                ErrorKind::AuthError => Attempt::Terminal(RouteError::AuthError {
                    model: model.id.clone(),
                    message: err.message,
                }),
                ErrorKind::InvalidRequest => Attempt::Terminal(RouteError::InvalidRequest {
                    model: Some(model.id.clone()),
                    message: err.message,
                }),
                kind => Attempt::Exhausted(FallbackEvent {
                    model_attempted: model.id.clone(),
                    provider: model.provider.clone(),
                    error_kind: kind,
                    attempts,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    message: err.message,
                }),
            },
        }
    }

    fn cached_result(
        &self,
        request: &GenerationRequest,
        settings: &Settings,
        cached: CachedResponse,
        started: Instant,
    ) -> InvocationResult {
        self.inner.ledger.record(LedgerRecord::cache_hit(
            &cached.provider,
            &cached.model_used,
            cached.input_tokens,
            cached.output_tokens,
        ));
        InvocationResult {
            text: cached.text,
            model_used: cached.model_used,
            provider: cached.provider,
            input_tokens: cached.input_tokens,
            output_tokens: cached.output_tokens,
            cost_usd: 0.0,
            cache_hit: true,
            fallback_events: Vec::new(),
            latency_ms: started.elapsed().as_millis() as u64,
            budget_exceeded: self.budget_flag(request.budget_mode, settings),
            finish_reason: cached.finish_reason,
        }
    }

    /// Route one request to a completed answer.
    pub async fn route(&self, request: GenerationRequest) -> Result<InvocationResult, RouteError> {
        let started = Instant::now();
        let settings = self.settings();
        self.validate(&request)?;

        let fingerprint = Fingerprint::of(&request);
        let ttl = Self::cache_ttl(&request, &settings);
        if ttl.is_some() {
            if let Some(cached) = self.inner.cache.get(&fingerprint) {
                return Ok(self.cached_result(&request, &settings, cached, started));
            }
        }

        self.budget_gate(&request, &settings)?;

        let retry = self.inner.retry;
        let request_ref = &request;
        let (completion, model, events) = self
            .run_chain(&request, &settings, false, |model, adapter| async move {
                let model_started = Instant::now();
                let outcome = retry_model(&retry, &model.id, || adapter.complete(&model, request_ref)).await;
                Self::settle(&model, model_started, outcome.attempts, outcome.result)
            })
            .await?;

        let (input_tokens, output_tokens) = match completion.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (
                request.estimated_input_tokens(),
                estimate_tokens(&completion.text),
            ),
        };
        let cost_usd = model.cost_usd(input_tokens, output_tokens);
        let fallback_used = !events.is_empty();

        self.inner.ledger.record(LedgerRecord::call(
            &model.provider,
            &model.id,
            input_tokens,
            output_tokens,
            cost_usd,
            fallback_used,
        ));

        if let Some(ttl) = ttl {
            self.inner.cache.put(
                fingerprint,
                CachedResponse {
                    text: completion.text.clone(),
                    model_used: model.id.clone(),
                    provider: model.provider.clone(),
                    input_tokens,
                    output_tokens,
                    finish_reason: completion.finish_reason.clone(),
                },
                ttl,
            );
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            model = %model.id,
            input_tokens,
            output_tokens,
            cost_usd,
            latency_ms,
            fallbacks = events.len(),
            "Request completed"
        );

        Ok(InvocationResult {
            text: completion.text,
            model_used: model.id.clone(),
            provider: model.provider.clone(),
            input_tokens,
            output_tokens,
            cost_usd,
            cache_hit: false,
            fallback_events: events,
            latency_ms,
            budget_exceeded: self.budget_flag(request.budget_mode, &settings),
            finish_reason: completion.finish_reason,
        })
    }

    /// Route one request to a chunk stream.
    ///
    /// Fallback happens only until the first chunk arrives; after that,
    /// failures surface as stream items.
    pub async fn route_stream(&self, request: GenerationRequest) -> Result<RoutedStream, RouteError> {
        let started = Instant::now();
        let settings = self.settings();
        self.validate(&request)?;

        let fingerprint = Fingerprint::of(&request);
        let ttl = Self::cache_ttl(&request, &settings);
        if ttl.is_some() {
            if let Some(cached) = self.inner.cache.get(&fingerprint) {
                if let Some(model) = self.inner.registry.get(&cached.model_used) {
                    let result = self.cached_result(&request, &settings, cached.clone(), started);
                    return Ok(RoutedStream::cached(
                        cached,
                        model,
                        result.budget_exceeded,
                        Arc::clone(&self.inner.ledger),
                        started,
                    ));
                }
            }
        }

        self.budget_gate(&request, &settings)?;

        let retry = self.inner.retry;
        let request_ref = &request;
        let ((first, stream), model, events) = self
            .run_chain(&request, &settings, true, |model, adapter| async move {
                let model_started = Instant::now();
                let outcome = retry_model(&retry, &model.id, || {
                    open_stream(adapter.as_ref(), &model, request_ref)
                })
                .await;
                Self::settle(&model, model_started, outcome.attempts, outcome.result)
            })
            .await?;

        tracing::debug!(model = %model.id, fallbacks = events.len(), "Stream started");

        let cache_slot = ttl.map(|ttl| CacheSlot {
            cache: Arc::clone(&self.inner.cache),
            key: fingerprint,
            ttl,
        });
        Ok(RoutedStream::live(
            stream,
            first,
            model,
            events,
            self.budget_flag(request.budget_mode, &settings),
            request.estimated_input_tokens(),
            Arc::clone(&self.inner.ledger),
            cache_slot,
            started,
        ))
    }

    /// Route every request with at most `batch_concurrency` in flight.
    ///
    /// Results are positional; one request's failure does not affect others.
    pub async fn route_batch(
        &self,
        requests: Vec<GenerationRequest>,
    ) -> Vec<Result<InvocationResult, RouteError>> {
        let limit = self.settings().batch_concurrency;
        let semaphore = Arc::new(Semaphore::new(limit));
        tracing::debug!(size = requests.len(), concurrency = limit, "Routing batch");

        let tasks = requests.into_iter().map(|request| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // The semaphore is never closed, so acquisition only fails if
                // that changes; run unbounded rather than drop the request.
                let _permit = semaphore.acquire_owned().await.ok();
                self.route(request).await
            }
        });
        futures::future::join_all(tasks).await
    }

    /// Like [`route`](Self::route), but an exhausted fallback chain resolves
    /// to the configured `fallback_response` text instead of an error.
    ///
    /// Static answers cost nothing and are neither cached nor recorded.
    pub async fn route_or_static(
        &self,
        request: GenerationRequest,
    ) -> Result<InvocationResult, RouteError> {
        let started = Instant::now();
        let budget_mode = request.budget_mode;
        match self.route(request).await {
            Err(RouteError::AllModelsExhausted {
                attempted,
                unavailable,
            }) => {
                let settings = self.settings();
                match settings.fallback_response.clone() {
                    Some(text) => {
                        tracing::warn!(
                            attempted = attempted.len(),
                            unavailable,
                            "Serving static fallback response"
                        );
                        Ok(InvocationResult {
                            text,
                            model_used: STATIC_FALLBACK_MODEL.to_string(),
                            provider: String::new(),
                            input_tokens: 0,
                            output_tokens: 0,
                            cost_usd: 0.0,
                            cache_hit: false,
                            fallback_events: attempted,
                            latency_ms: started.elapsed().as_millis() as u64,
                            budget_exceeded: self.budget_flag(budget_mode, &settings),
                            finish_reason: None,
                        })
                    }
                    None => Err(RouteError::AllModelsExhausted {
                        attempted,
                        unavailable,
                    }),
                }
            }
            other => other,
        }
    }
}

/// Open a stream and wait for its first chunk, so failures before any
/// output can still fall back.
async fn open_stream(
    adapter: &dyn ProviderAdapter,
    model: &ModelDescriptor,
    request: &GenerationRequest,
) -> Result<(Option<StreamChunk>, ChunkStream), ProviderError> {
    let mut stream = adapter.complete_stream(model, request).await?;
    match stream.next().await {
        Some(Ok(chunk)) => Ok((Some(chunk), stream)),
        Some(Err(err)) => Err(err),
        None => Ok((None, stream)),
    }
}
