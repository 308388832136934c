use crate::registry::Capability;

use super::FallbackEvent;

/// Terminal outcome of a routed request that produced no answer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    /// Credentials were rejected; other models on the same provider would fail too.
    #[error("Authentication failed for model '{model}': {message}")]
    AuthError { model: String, message: String },

    /// The request itself is malformed; retrying elsewhere cannot help.
    #[error("Invalid request{}: {message}", model.as_deref().map(|m| format!(" for model '{}'", m)).unwrap_or_default())]
    InvalidRequest {
        model: Option<String>,
        message: String,
    },

    #[error("Budget exceeded: spent ${spent_usd:.4} of ${limit_usd:.4} limit")]
    BudgetExceeded { spent_usd: f64, limit_usd: f64 },

    /// Every qualifying model either failed with retryable errors or was
    /// unavailable (tripped health circuit, no adapter).
    #[error("All models exhausted: {} attempted, {unavailable} unavailable", attempted.len())]
    AllModelsExhausted {
        attempted: Vec<FallbackEvent>,
        unavailable: usize,
    },

    #[error("No model available for capability '{capability}'")]
    NoModelAvailable { capability: Capability },

    #[error("Unknown model '{0}'")]
    UnknownModel(String),
}

impl RouteError {
    /// Stable snake_case code for wire formats and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::AuthError { .. } => "auth_error",
            RouteError::InvalidRequest { .. } => "invalid_request",
            RouteError::BudgetExceeded { .. } => "budget_exceeded",
            RouteError::AllModelsExhausted { .. } => "all_models_exhausted",
            RouteError::NoModelAvailable { .. } => "no_model_available",
            RouteError::UnknownModel(_) => "unknown_model",
        }
    }

    /// Fallback events leading up to this error.
    pub fn fallback_events(&self) -> &[FallbackEvent] {
        match self {
            RouteError::AllModelsExhausted { attempted, .. } => attempted,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = RouteError::InvalidRequest {
            model: Some("gpt-4o".to_string()),
            message: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid request for model 'gpt-4o': bad");

        let err = RouteError::InvalidRequest {
            model: None,
            message: "empty messages".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid request: empty messages");

        let err = RouteError::BudgetExceeded {
            spent_usd: 1.05,
            limit_usd: 1.0,
        };
        assert_eq!(
            err.to_string(),
            "Budget exceeded: spent $1.0500 of $1.0000 limit"
        );

        let err = RouteError::AllModelsExhausted {
            attempted: vec![],
            unavailable: 2,
        };
        assert_eq!(
            err.to_string(),
            "All models exhausted: 0 attempted, 2 unavailable"
        );
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(
            RouteError::NoModelAvailable {
                capability: Capability::Research
            }
            .kind(),
            "no_model_available"
        );
        assert_eq!(
            RouteError::AllModelsExhausted {
                attempted: vec![],
                unavailable: 3
            }
            .kind(),
            "all_models_exhausted"
        );
    }
}
