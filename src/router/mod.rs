//! Request routing: selection, retry, fallback, caching, and accounting.

mod engine;
mod error;
mod health;
mod retry;
mod stream;
mod types;

pub use engine::{BudgetReport, Router, RouterBuilder, STATIC_FALLBACK_MODEL};
pub use error::RouteError;
pub use health::{HealthState, ModelHealthSnapshot};
pub use retry::RetryPolicy;
pub use stream::RoutedStream;
pub use types::{
    format_fallback_summary, FallbackEvent, GenerationRequest, InvocationResult, Message, Role,
    SamplingParams,
};
