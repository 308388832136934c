//! Model registry.
//!
//! This module holds the catalog of execution targets and selects a model
//! for a request based on:
//! - Capability tags
//! - Cost (input + output price per 1k tokens)
//! - Models already attempted for the request

mod catalog;
mod model;

pub use catalog::{ModelRegistry, RegistryError};
pub use model::{Capability, ModelDescriptor};
