//! Per-model health tracking.
//!
//! A model that fails `failure_threshold` requests in a row is tripped and
//! skipped by selection for `cooldown`. After the cooldown one request is let
//! through as a trial: success restores the model, failure trips it again
//! with a fresh cooldown. Concurrent requests skip a half-open model rather
//! than wait for it.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::provider::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Selected normally; consecutive failures are counted.
    Healthy,
    /// Skipped until the cooldown elapses.
    Tripped,
    /// Cooldown elapsed; a single trial decides recovery.
    HalfOpen,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Tripped => "tripped",
            HealthState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelHealthSnapshot {
    pub model: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub trip_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
}

struct ModelHealth {
    state: HealthState,
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
    trip_count: u32,
    trial_in_flight: bool,
    last_error: Option<ErrorKind>,
}

impl ModelHealth {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            tripped_at: None,
            trip_count: 0,
            trial_in_flight: false,
            last_error: None,
        }
    }

    /// `Some(is_trial)` when a request may proceed.
    fn admit(&mut self, cooldown: Duration) -> Option<bool> {
        match self.state {
            HealthState::Healthy => Some(false),
            HealthState::Tripped => {
                let elapsed = self
                    .tripped_at
                    .map(|at| Instant::now().duration_since(at))
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    self.state = HealthState::HalfOpen;
                    self.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            HealthState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Some(true)
            }
            HealthState::HalfOpen => None,
        }
    }

    fn trip(&mut self, model: &str) {
        self.state = HealthState::Tripped;
        self.tripped_at = Some(Instant::now());
        self.trial_in_flight = false;
        self.trip_count += 1;
        tracing::warn!(
            model = %model,
            consecutive_failures = self.consecutive_failures,
            last_error = ?self.last_error,
            trip_count = self.trip_count,
            "Model tripped, skipping until cooldown elapses"
        );
    }
}

pub struct HealthTracker {
    enabled: bool,
    failure_threshold: u32,
    cooldown: Duration,
    models: DashMap<String, Mutex<ModelHealth>>,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            models: DashMap::new(),
        }
    }

    /// Tracker that admits every request and records nothing.
    pub fn disabled() -> Self {
        Self::new(&HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        })
    }

    /// Ask to send a request to `model`. `None` means skip it.
    pub fn admit(&self, model: &str) -> Option<HealthPermit<'_>> {
        if !self.enabled {
            return Some(HealthPermit::new(self, model, false));
        }
        let entry = self
            .models
            .entry(model.to_string())
            .or_insert_with(|| Mutex::new(ModelHealth::new()));
        let admitted = entry.lock().unwrap_or_else(|e| e.into_inner()).admit(self.cooldown);
        drop(entry);

        match admitted {
            Some(trial) => {
                if trial {
                    tracing::info!(model = %model, "Cooldown elapsed, trying model");
                }
                Some(HealthPermit::new(self, model, trial))
            }
            None => {
                tracing::debug!(model = %model, "Skipping unhealthy model");
                None
            }
        }
    }

    fn with_model(&self, model: &str, f: impl FnOnce(&mut ModelHealth)) {
        if !self.enabled {
            return;
        }
        if let Some(entry) = self.models.get(model) {
            f(&mut entry.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    fn record_success(&self, model: &str) {
        self.with_model(model, |health| {
            if health.state != HealthState::Healthy {
                tracing::info!(model = %model, "Trial succeeded, model restored");
            }
            health.state = HealthState::Healthy;
            health.consecutive_failures = 0;
            health.trial_in_flight = false;
        });
    }

    fn record_failure(&self, model: &str, kind: ErrorKind, trial: bool) {
        let threshold = self.failure_threshold;
        self.with_model(model, |health| {
            health.consecutive_failures += 1;
            health.last_error = Some(kind);
            if trial || health.consecutive_failures >= threshold {
                health.trip(model);
            }
        });
    }

    fn release_trial(&self, model: &str) {
        self.with_model(model, |health| health.trial_in_flight = false);
    }

    pub fn state(&self, model: &str) -> HealthState {
        self.models
            .get(model)
            .map(|entry| entry.lock().unwrap_or_else(|e| e.into_inner()).state)
            .unwrap_or(HealthState::Healthy)
    }

    /// State of every model that has been admitted at least once.
    pub fn snapshot(&self) -> Vec<ModelHealthSnapshot> {
        let mut out: Vec<ModelHealthSnapshot> = self
            .models
            .iter()
            .map(|entry| {
                let health = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                ModelHealthSnapshot {
                    model: entry.key().clone(),
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    trip_count: health.trip_count,
                    last_error: health.last_error,
                }
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }
}

/// Outstanding admission for one request on one model.
///
/// Must be resolved with [`success`](Self::success),
/// [`failure`](Self::failure) or [`neutral`](Self::neutral). Dropping an
/// unresolved trial counts as a failed trial so the model never sticks in
/// `HalfOpen`.
pub struct HealthPermit<'a> {
    tracker: &'a HealthTracker,
    model: String,
    trial: bool,
    resolved: bool,
}

impl<'a> HealthPermit<'a> {
    fn new(tracker: &'a HealthTracker, model: &str, trial: bool) -> Self {
        Self {
            tracker,
            model: model.to_string(),
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.tracker.record_success(&self.model);
    }

    /// The model failed this request after its retries.
    pub fn failure(mut self, kind: ErrorKind) {
        self.resolved = true;
        self.tracker.record_failure(&self.model, kind, self.trial);
    }

    /// The request ended for a reason that says nothing about model health.
    pub fn neutral(mut self) {
        self.resolved = true;
        if self.trial {
            self.tracker.release_trial(&self.model);
        }
    }
}

impl Drop for HealthPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            tracing::warn!(model = %self.model, "Trial dropped without resolution, treating as failure");
            self.tracker
                .record_failure(&self.model, ErrorKind::ServerError, true);
        }
    }
}
