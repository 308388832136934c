//! Shared helpers for router integration tests.
//!
//! `ScriptedAdapter` stands in for a provider: each model id gets a queue of
//! scripted steps, falling back to a default step once the queue is empty.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use costroute::config::{CacheConfig, HealthConfig, RouterConfig};
use costroute::provider::{
    ChunkStream, Completion, ErrorKind, ProviderAdapter, ProviderError, StreamChunk, TokenUsage,
};
use costroute::registry::{Capability, ModelDescriptor};
use costroute::router::{GenerationRequest, Router, RouterBuilder};

/// Any message containing this marker is rejected as INVALID_REQUEST.
pub const INVALID_MARKER: &str = "<<invalid>>";

#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed with this text.
    Reply(String),
    /// Fail before producing anything.
    Fail(ErrorKind),
    /// Never answer.
    Hang,
    /// Open a stream whose first item is an error.
    BrokenStream(ErrorKind),
    /// Stream this text, then stall forever.
    Endless(String),
}

pub fn reply(text: &str) -> Step {
    Step::Reply(text.to_string())
}

pub struct ScriptedAdapter {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    defaults: Mutex<HashMap<String, Step>>,
    calls: Mutex<Vec<String>>,
    usage: Option<TokenUsage>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            }),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Report this usage on every success. `None` omits usage.
    pub fn with_usage(mut self, usage: Option<(u32, u32)>) -> Self {
        self.usage = usage.map(|(input_tokens, output_tokens)| TokenUsage {
            input_tokens,
            output_tokens,
        });
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Behavior of `model` once its queue is empty.
    pub fn always(self, model: &str, step: Step) -> Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(model.to_string(), step);
        self
    }

    /// Queue one step for the next call to `model`.
    pub fn then(self, model: &str, step: Step) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Model ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, model: &str) -> usize {
        self.calls().iter().filter(|m| m.as_str() == model).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Step {
        self.calls.lock().unwrap().push(model.id.clone());
        if request
            .messages
            .iter()
            .any(|m| m.content.contains(INVALID_MARKER))
        {
            return Step::Fail(ErrorKind::InvalidRequest);
        }
        if let Some(step) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&model.id)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&model.id)
            .cloned()
            .unwrap_or_else(|| Step::Reply(format!("answer from {}", model.id)))
    }

    async fn simulate_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn error(kind: ErrorKind) -> ProviderError {
        ProviderError::new(kind, format!("scripted {}", kind))
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<Completion, ProviderError> {
        let step = self.next_step(model, request);
        self.simulate_latency().await;
        match step {
            Step::Reply(text) | Step::Endless(text) => Ok(Completion {
                text,
                usage: self.usage,
                finish_reason: Some("stop".to_string()),
            }),
            Step::Fail(kind) | Step::BrokenStream(kind) => Err(Self::error(kind)),
            Step::Hang => futures::future::pending().await,
        }
    }

    async fn complete_stream(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let step = self.next_step(model, request);
        self.simulate_latency().await;
        match step {
            Step::Reply(text) => {
                let mut chunks: Vec<Result<StreamChunk, ProviderError>> = text
                    .split_inclusive(' ')
                    .map(|piece| Ok(StreamChunk::text(piece)))
                    .collect();
                chunks.push(Ok(StreamChunk {
                    usage: self.usage,
                    finish_reason: Some("stop".to_string()),
                    ..StreamChunk::default()
                }));
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            Step::Endless(text) => Ok(Box::pin(
                futures::stream::iter(vec![Ok(StreamChunk::text(text))])
                    .chain(futures::stream::pending()),
            )),
            Step::BrokenStream(kind) => Ok(Box::pin(futures::stream::iter(vec![Err(
                Self::error(kind),
            )]))),
            Step::Fail(kind) => Err(Self::error(kind)),
            Step::Hang => futures::future::pending().await,
        }
    }
}

/// Model on the "mock" provider with the given combined pricing.
pub fn model(id: &str, caps: &[Capability], price_in: f64, price_out: f64) -> ModelDescriptor {
    ModelDescriptor::new(id, "mock", caps.iter().copied(), price_in, price_out, 128_000)
}

/// Three SIMPLE models, cheapest first: a < b < c.
pub fn chain_models() -> Vec<ModelDescriptor> {
    vec![
        model("model-c", &[Capability::Simple], 0.003, 0.003),
        model("model-a", &[Capability::Simple], 0.001, 0.001),
        model("model-b", &[Capability::Simple], 0.002, 0.002),
    ]
}

/// Fast retries, no health tracking, default cache.
pub fn fast_router_config() -> RouterConfig {
    RouterConfig {
        max_retries: 0,
        backoff_base_ms: 1,
        ..RouterConfig::default()
    }
}

pub fn builder(adapter: Arc<ScriptedAdapter>, models: Vec<ModelDescriptor>) -> RouterBuilder {
    Router::builder()
        .models(models)
        .adapter("mock", adapter)
        .router_config(fast_router_config())
        .cache_config(CacheConfig::default())
        .health_config(HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        })
}

pub fn router(adapter: Arc<ScriptedAdapter>, models: Vec<ModelDescriptor>) -> Router {
    builder(adapter, models).build().unwrap()
}
