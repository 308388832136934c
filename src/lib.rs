//! costroute - cost-aware routing across LLM providers
//!
//! Picks the cheapest model that can serve a request, retries and falls back
//! across models on transient failures, caches repeat answers, and keeps a
//! ledger of spend that can enforce a budget.

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod provider;
pub mod registry;
pub mod router;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use router::{GenerationRequest, InvocationResult, RouteError, Router};
