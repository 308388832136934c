//! Model selection logic.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::model::{Capability, ModelDescriptor};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("No model available for capability '{capability}'")]
    NotFound { capability: Capability },

    #[error("Model '{0}' is already registered")]
    Duplicate(String),

    #[error("Model '{id}' has invalid pricing: {message}")]
    InvalidPricing { id: String, message: String },
}

/// Catalog of execution targets.
///
/// Reads take a shared lock and clone `Arc`s out; `register` takes the
/// exclusive section. Registration order is kept because it is the final
/// selection tie-breaker.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<Vec<Arc<ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from descriptors, in order.
    pub fn from_models(
        models: impl IntoIterator<Item = ModelDescriptor>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for model in models {
            registry.register(model)?;
        }
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<ModelDescriptor>>> {
        // The vector is only ever pushed to, so a poisoned lock still holds valid data.
        self.models.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<ModelDescriptor>>> {
        self.models.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a descriptor. Ids are unique; prices must be finite and non-negative.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<(), RegistryError> {
        for (label, price) in [
            ("input", descriptor.price_per_1k_input),
            ("output", descriptor.price_per_1k_output),
        ] {
            if !price.is_finite() || price < 0.0 {
                return Err(RegistryError::InvalidPricing {
                    id: descriptor.id.clone(),
                    message: format!("{} price {} is not a non-negative number", label, price),
                });
            }
        }

        let mut models = self.write();
        if models.iter().any(|m| m.id == descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }

        tracing::debug!(
            model = %descriptor.id,
            provider = %descriptor.provider,
            "Registered model"
        );
        models.push(Arc::new(descriptor));
        Ok(())
    }

    /// Select the cheapest model that supports `capability` and is not excluded.
    ///
    /// Ties on combined price go to the larger context window, then to the
    /// earlier registration.
    pub fn select(
        &self,
        capability: Capability,
        excluding: &HashSet<String>,
    ) -> Result<Arc<ModelDescriptor>, RegistryError> {
        self.select_where(capability, excluding, |_| true)
    }

    /// Like [`select`](Self::select) with an extra eligibility predicate.
    pub fn select_where<F>(
        &self,
        capability: Capability,
        excluding: &HashSet<String>,
        eligible: F,
    ) -> Result<Arc<ModelDescriptor>, RegistryError>
    where
        F: Fn(&ModelDescriptor) -> bool,
    {
        let models = self.read();
        let mut best: Option<&Arc<ModelDescriptor>> = None;

        for model in models.iter() {
            if !model.supports(capability) || excluding.contains(&model.id) || !eligible(model) {
                continue;
            }
            best = match best {
                None => Some(model),
                Some(current) if is_better(model, current) => Some(model),
                keep => keep,
            };
        }

        best.cloned()
            .ok_or(RegistryError::NotFound { capability })
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: &str) -> Option<Arc<ModelDescriptor>> {
        self.read().iter().find(|m| m.id == id).cloned()
    }

    /// All descriptors in registration order, optionally filtered by capability.
    pub fn list(&self, capability: Option<Capability>) -> Vec<Arc<ModelDescriptor>> {
        self.read()
            .iter()
            .filter(|m| capability.map_or(true, |c| m.supports(c)))
            .cloned()
            .collect()
    }

    /// Like [`list`](Self::list), in selection order: cheapest first.
    pub fn ranked(&self, capability: Option<Capability>) -> Vec<Arc<ModelDescriptor>> {
        let mut models = self.list(capability);
        // Stable sort keeps registration order among equals.
        models.sort_by(|a, b| {
            a.combined_price()
                .total_cmp(&b.combined_price())
                .then(b.max_context_tokens.cmp(&a.max_context_tokens))
        });
        models
    }

    /// Number of models that support `capability`.
    pub fn count(&self, capability: Capability) -> usize {
        self.read().iter().filter(|m| m.supports(capability)).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Strictly better by (lower combined price, larger context). Equal keeps the incumbent.
fn is_better(candidate: &ModelDescriptor, current: &ModelDescriptor) -> bool {
    match candidate
        .combined_price()
        .total_cmp(&current.combined_price())
    {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => candidate.max_context_tokens > current.max_context_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_registry() -> ModelRegistry {
        ModelRegistry::from_models([
            ModelDescriptor::new(
                "gpt-3.5",
                "openai",
                [Capability::Simple, Capability::Moderate],
                0.0005,
                0.0015,
                16_385,
            ),
            ModelDescriptor::new(
                "gpt-4o",
                "openai",
                [
                    Capability::Simple,
                    Capability::Moderate,
                    Capability::Complex,
                    Capability::Coding,
                ],
                0.0025,
                0.01,
                128_000,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_select_cheapest_for_simple() {
        let registry = scenario_registry();
        let selected = registry
            .select(Capability::Simple, &HashSet::new())
            .unwrap();
        assert_eq!(selected.id, "gpt-3.5");
    }

    #[test]
    fn test_select_respects_capability() {
        let registry = scenario_registry();
        let selected = registry
            .select(Capability::Complex, &HashSet::new())
            .unwrap();
        assert_eq!(selected.id, "gpt-4o");
        assert!(selected.supports(Capability::Complex));
    }

    #[test]
    fn test_select_excluding() {
        let registry = scenario_registry();
        let excluded: HashSet<String> = ["gpt-3.5".to_string()].into_iter().collect();
        let selected = registry.select(Capability::Simple, &excluded).unwrap();
        assert_eq!(selected.id, "gpt-4o");

        let all: HashSet<String> = ["gpt-3.5".to_string(), "gpt-4o".to_string()]
            .into_iter()
            .collect();
        assert_eq!(
            registry.select(Capability::Simple, &all),
            Err(RegistryError::NotFound {
                capability: Capability::Simple
            })
        );
    }

    #[test]
    fn test_no_model_for_capability() {
        let registry = scenario_registry();
        let result = registry.select(Capability::Research, &HashSet::new());
        assert!(matches!(result, Err(RegistryError::NotFound { .. })));
    }

    #[test]
    fn test_tie_broken_by_context_then_registration_order() {
        let registry = ModelRegistry::from_models([
            ModelDescriptor::new("small", "p", [Capability::Simple], 0.001, 0.001, 8_000),
            ModelDescriptor::new("large", "p", [Capability::Simple], 0.001, 0.001, 32_000),
            ModelDescriptor::new("large-too", "p", [Capability::Simple], 0.001, 0.001, 32_000),
        ])
        .unwrap();

        let selected = registry
            .select(Capability::Simple, &HashSet::new())
            .unwrap();
        assert_eq!(selected.id, "large");
    }

    #[test]
    fn test_select_where_predicate() {
        let registry = scenario_registry();
        let selected = registry
            .select_where(Capability::Simple, &HashSet::new(), |m| {
                m.max_context_tokens >= 100_000
            })
            .unwrap();
        assert_eq!(selected.id, "gpt-4o");
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = scenario_registry();
        let dup = ModelDescriptor::new("gpt-4o", "other", [Capability::Simple], 0.0, 0.0, 1);
        assert_eq!(
            registry.register(dup),
            Err(RegistryError::Duplicate("gpt-4o".to_string()))
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_invalid_price_rejected() {
        let registry = ModelRegistry::new();
        let bad = ModelDescriptor::new("bad", "p", [Capability::Simple], -1.0, 0.0, 1);
        assert!(matches!(
            registry.register(bad),
            Err(RegistryError::InvalidPricing { .. })
        ));
        let nan = ModelDescriptor::new("nan", "p", [Capability::Simple], 0.0, f64::NAN, 1);
        assert!(registry.register(nan).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_filters_by_capability() {
        let registry = scenario_registry();
        assert_eq!(registry.list(None).len(), 2);
        let coding = registry.list(Some(Capability::Coding));
        assert_eq!(coding.len(), 1);
        assert_eq!(coding[0].id, "gpt-4o");
        assert_eq!(registry.count(Capability::Simple), 2);
    }

    #[test]
    fn test_ranked_is_cheapest_first() {
        let registry = ModelRegistry::from_models([
            ModelDescriptor::new("pricey", "p", [Capability::Simple], 0.01, 0.03, 8_000),
            ModelDescriptor::new("cheap", "p", [Capability::Simple], 0.001, 0.002, 8_000),
        ])
        .unwrap();
        let ids: Vec<String> = registry
            .ranked(None)
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["cheap", "pricey"]);
    }

    #[test]
    fn test_concurrent_reads_during_register() {
        let registry = Arc::new(scenario_registry());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = registry.clone();
            handles.push(std::thread::spawn(move || {
                if i % 4 == 0 {
                    reg.register(ModelDescriptor::new(
                        format!("extra-{}", i),
                        "p",
                        [Capability::Research],
                        0.01,
                        0.01,
                        1_000,
                    ))
                    .unwrap();
                }
                for _ in 0..100 {
                    let m = reg.select(Capability::Simple, &HashSet::new()).unwrap();
                    assert_eq!(m.id, "gpt-3.5");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
