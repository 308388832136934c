//! Error types for costroute.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::router::RouteError;

/// Result type alias for costroute operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for costroute.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Route(err) => match err {
                RouteError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
                RouteError::AuthError { .. } => StatusCode::BAD_GATEWAY,
                RouteError::InvalidRequest { .. }
                | RouteError::NoModelAvailable { .. }
                | RouteError::UnknownModel(_) => StatusCode::BAD_REQUEST,
                RouteError::AllModelsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Registry(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error type for response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Route(err) => err.kind(),
            Error::BadRequest(_) => "bad_request",
            Error::Config(_) => "config_error",
            Error::Registry(_) => "registry_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut error = serde_json::json!({
            "message": self.to_string(),
            "type": self.kind(),
            "code": status.as_u16()
        });
        if let Error::Route(route) = &self {
            if !route.fallback_events().is_empty() {
                error["fallback_events"] = serde_json::json!(route.fallback_events());
            }
        }

        (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
    }
}
