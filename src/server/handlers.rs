//! HTTP request handlers.

use axum::{
    extract::{Query, State},
    http::{HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use super::AppState;
use crate::error::Error;
use crate::registry::{Capability, ModelDescriptor};
use crate::router::{format_fallback_summary, FallbackEvent, GenerationRequest, InvocationResult};

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-costroute-request-id";
/// Response header: model that produced the answer.
pub const MODEL_HEADER: &str = "x-costroute-model";
/// Response header: cost in USD (decimal, e.g. "0.000420").
pub const COST_USD_HEADER: &str = "x-costroute-cost-usd";
/// Response header: wall-clock latency in milliseconds.
pub const LATENCY_MS_HEADER: &str = "x-costroute-latency-ms";
/// Response header: "hit" or "miss".
pub const CACHE_HEADER: &str = "x-costroute-cache";
/// Response header: calls per abandoned model, e.g. "3/model-a, 1/model-b".
pub const FALLBACKS_HEADER: &str = "x-costroute-fallbacks";

/// Body of POST /v1/generate.
#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(flatten)]
    pub request: GenerationRequest,
    #[serde(default)]
    pub stream: bool,
}

/// Body of POST /v1/batch.
#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<GenerationRequest>,
}

/// One positional batch outcome.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum BatchItem {
    Ok(InvocationResult),
    Error(BatchError),
}

#[derive(Debug, Serialize)]
struct BatchError {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fallback_events: Vec<FallbackEvent>,
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    // Values that are not valid header text (e.g. odd model ids) are dropped.
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Attach routing metadata headers. Cost and latency are only known for
/// completed (non-streaming) answers.
fn attach_headers(
    response: &mut Response,
    request_id: &str,
    model: &str,
    cache_hit: bool,
    fallback_events: &[FallbackEvent],
    completed: Option<(f64, u64)>,
) {
    insert_header(response, REQUEST_ID_HEADER, request_id);
    insert_header(response, MODEL_HEADER, model);
    insert_header(response, CACHE_HEADER, if cache_hit { "hit" } else { "miss" });
    if let Some(summary) = format_fallback_summary(fallback_events) {
        insert_header(response, FALLBACKS_HEADER, &summary);
    }
    if let Some((cost_usd, latency_ms)) = completed {
        insert_header(response, COST_USD_HEADER, &format!("{:.6}", cost_usd));
        insert_header(response, LATENCY_MS_HEADER, &latency_ms.to_string());
    }
}

/// Handle POST /v1/generate
pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Response, Error> {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(
        request_id = %request_id,
        capability = %body.request.required_capability,
        stream = body.stream,
        "Generate request"
    );

    if body.stream {
        return generate_stream(state, body.request, request_id).await;
    }

    let result = state.router.route_or_static(body.request).await?;
    let mut response = Json(&result).into_response();
    attach_headers(
        &mut response,
        &request_id,
        &result.model_used,
        result.cache_hit,
        &result.fallback_events,
        Some((result.cost_usd, result.latency_ms)),
    );
    Ok(response)
}

async fn generate_stream(
    state: AppState,
    request: GenerationRequest,
    request_id: String,
) -> Result<Response, Error> {
    let stream = state.router.route_stream(request).await?;

    let model = stream.model_used().to_string();
    let cache_hit = stream.cache_hit();
    let fallback_events = stream.fallback_events().to_vec();

    // Dropping the SSE body on client disconnect drops the RoutedStream,
    // which releases the provider connection and records partial usage.
    let events = stream
        .map(|item| {
            let payload = match item {
                Ok(chunk) => serde_json::json!({
                    "text": chunk.text,
                    "finish_reason": chunk.finish_reason,
                }),
                Err(err) => serde_json::json!({
                    "error": { "type": err.kind.as_str(), "message": err.message }
                }),
            };
            Ok::<_, Infallible>(Event::default().data(payload.to_string()))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    attach_headers(
        &mut response,
        &request_id,
        &model,
        cache_hit,
        &fallback_events,
        None,
    );
    Ok(response)
}

/// Handle POST /v1/batch
pub async fn batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Result<Response, Error> {
    if body.requests.is_empty() {
        return Err(Error::BadRequest("Batch has no requests".to_string()));
    }

    let results = state.router.route_batch(body.requests).await;
    let items: Vec<BatchItem> = results
        .into_iter()
        .map(|result| match result {
            Ok(result) => BatchItem::Ok(result),
            Err(err) => BatchItem::Error(BatchError {
                kind: err.kind(),
                message: err.to_string(),
                fallback_events: err.fallback_events().to_vec(),
            }),
        })
        .collect();

    Ok(Json(items).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    pub capability: Option<String>,
}

/// Handle GET /v1/models
pub async fn list_models(
    State(state): State<AppState>,
    Query(params): Query<ModelsQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    let capability = params
        .capability
        .as_deref()
        .map(str::parse::<Capability>)
        .transpose()
        .map_err(Error::BadRequest)?;

    let models: Vec<ModelDescriptor> = state
        .router
        .registry()
        .ranked(capability)
        .iter()
        .map(|m| ModelDescriptor::clone(m))
        .collect();

    Ok(Json(serde_json::json!({
        "object": "list",
        "data": models
    })))
}

/// Handle GET /v1/budget
pub async fn budget(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.budget_report())
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let models = state.router.health();
    let degraded = models
        .iter()
        .any(|m| m.state != crate::router::HealthState::Healthy);
    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "service": "costroute",
        "models": models,
        "cache": state.router.cache_stats(),
    }))
}
