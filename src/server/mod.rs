//! HTTP facade over the router.

mod handlers;
mod stats;

pub use handlers::{
    BatchBody, GenerateBody, CACHE_HEADER, COST_USD_HEADER, FALLBACKS_HEADER, LATENCY_MS_HEADER,
    MODEL_HEADER, REQUEST_ID_HEADER,
};
pub use stats::{resolve_time_range, RangePreset, StatsQuery, StatsResponse};

use axum::{
    routing::{get, post},
    Router as AxumRouter,
};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::router::Router;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Router,
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/generate", post(handlers::generate))
        .route("/v1/batch", post(handlers::batch))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/stats", get(stats::stats_handler))
        .route("/v1/budget", get(handlers::budget))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until it fails.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let router = Router::new(&config)?;

    tracing::info!(
        models = router.registry().len(),
        providers = config.providers.len(),
        "Router ready"
    );

    let app = create_router(AppState { router });

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting costroute server");

    axum::serve(listener, app).await?;

    Ok(())
}
