//! Model Fallback Chain
//!
//! When a request against a primary model fails, the fallback chain decides
//! whether the failure warrants trying alternatives and, if so, walks the
//! configured alternatives in order until one succeeds.
//!
//! # Flow
//!
//! ```text
//! primary model fails (error)
//!         |
//!         v
//! enabled rule for primary? ──no──> not attempted
//!         | yes
//!         v
//! any rule condition matches error? ──no──> not attempted
//!         | yes
//!         v
//! attempt 0 = primary failure, primary breaker += failure
//!         |
//!         v
//! for each fallback model, in order:
//!     breaker open?            ──> skip (remember it)
//!     unknown / unavailable?   ──> skip
//!     fails requirements?      ──> skip
//!     provider unavailable?    ──> skip
//!     execute(candidate) ──ok──> success
//!         | err
//!         v
//!     breaker += failure, next candidate
//! ```
//!
//! Each rule carries its own breaker threshold and cool-down, so the same
//! model can sit behind rules with different sensitivities. At most
//! `max_retries` fallback executions are made per call, separated by
//! `retry_delay_ms`.
//!
//! # Thread Safety
//!
//! Rules live behind a `parking_lot::RwLock` and are cloned out before any
//! await point. Breakers are per-model `DashMap` entries.

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{CircuitBreakerState, CircuitBreakers, CircuitState};
pub use registry::{ModelInfo, ModelRegistry, ModelRequirements, StaticModelRegistry};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::health::ProviderHealthMonitor;
use crate::metrics::MetricsSink;
use crate::types::{FailureReason, ProviderError, ProviderModel};

// ============================================================================
// Rules
// ============================================================================

/// Failure kinds that trigger a fallback
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCondition {
    /// Any error
    Error,
    RateLimit,
    Timeout,
    Unavailable,
}

impl FallbackCondition {
    pub const ALL: [FallbackCondition; 4] = [
        Self::Error,
        Self::RateLimit,
        Self::Timeout,
        Self::Unavailable,
    ];

    /// Whether `error` satisfies this condition
    ///
    /// A structured reason on the error is authoritative. Without one, the
    /// status code and message are matched by keyword, which is best-effort.
    pub fn matches(&self, error: &ProviderError) -> bool {
        if *self == Self::Error {
            return true;
        }

        if let Some(reason) = error.reason {
            return matches!(
                (self, reason),
                (Self::RateLimit, FailureReason::RateLimit)
                    | (Self::Timeout, FailureReason::Timeout)
                    | (Self::Unavailable, FailureReason::ProviderUnavailable)
            );
        }

        let message = error.message.to_lowercase();
        match self {
            Self::Error => true,
            Self::RateLimit => {
                error.status == Some(429) || message.contains("rate limit") || message.contains("429")
            }
            Self::Timeout => message.contains("timeout") || message.contains("timed out"),
            Self::Unavailable => {
                error.status == Some(503)
                    || message.contains("unavailable")
                    || message.contains("not available")
                    || message.contains("503")
            }
        }
    }
}

fn default_conditions() -> BTreeSet<FallbackCondition> {
    FallbackCondition::ALL.into_iter().collect()
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout_ms() -> u64 {
    60_000
}

/// Fallback policy for one primary model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub primary_model: String,

    /// Alternatives, tried in order
    pub fallback_models: Vec<String>,

    #[serde(default = "default_conditions")]
    pub conditions: BTreeSet<FallbackCondition>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum fallback executions per call
    ///
    /// This truncates the chain: once this many alternatives have been
    /// called, the remaining `fallback_models` are not tried. Skipped
    /// candidates (open breaker, unavailable, unhealthy provider) do not
    /// count against it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between consecutive fallback executions
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Failures before a model's breaker opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long an open breaker stays open
    #[serde(default = "default_circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout_ms: u64,
}

impl FallbackRule {
    pub fn new<I, S>(primary_model: impl Into<String>, fallback_models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary_model: primary_model.into(),
            fallback_models: fallback_models.into_iter().map(Into::into).collect(),
            conditions: default_conditions(),
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout_ms: default_circuit_breaker_timeout_ms(),
        }
    }

    #[must_use]
    pub fn with_conditions<I>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = FallbackCondition>,
    {
        self.conditions = conditions.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, threshold: u32, timeout: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    /// Whether any of the rule's conditions match `error`
    pub fn matches(&self, error: &ProviderError) -> bool {
        self.conditions.iter().any(|c| c.matches(error))
    }

    /// Reject rules that could loop or never trip
    pub fn validate(&self) -> Result<(), FallbackError> {
        let invalid = |reason: &str| FallbackError::InvalidRule {
            model: self.primary_model.clone(),
            reason: reason.to_string(),
        };

        if self.fallback_models.is_empty() {
            return Err(invalid("fallback_models is empty"));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(invalid("circuit_breaker_threshold must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries must be at least 1"));
        }

        let mut seen = HashSet::new();
        seen.insert(self.primary_model.as_str());
        for fallback in &self.fallback_models {
            if !seen.insert(fallback.as_str()) {
                return Err(FallbackError::CycleDetected {
                    model: fallback.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Errors from rule administration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FallbackError {
    #[error("no fallback rule for model {model}")]
    RuleNotFound { model: String },

    #[error("fallback rule for model {model} already exists")]
    RuleExists { model: String },

    #[error("invalid fallback rule for {model}: {reason}")]
    InvalidRule { model: String, reason: String },

    #[error("model {model} appears more than once in its fallback chain")]
    CycleDetected { model: String },
}

// ============================================================================
// Results
// ============================================================================

/// One execution in a fallback sequence
///
/// Attempt 0 is always the primary failure that started the sequence.
#[derive(Clone, Debug)]
pub struct FallbackAttempt {
    pub attempt_number: u32,
    pub model: String,
    pub provider: Option<String>,
    pub success: bool,
    pub latency: Duration,
    pub error: Option<ProviderError>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`ModelFallbackChain::execute_fallback`]
#[derive(Debug)]
pub struct FallbackResult<T> {
    pub success: bool,
    pub final_model: String,
    pub attempts: Vec<FallbackAttempt>,
    pub fallbacks_used: u32,
    /// Set on exhaustion when at least one candidate was skipped by an open breaker
    pub circuit_breaker_triggered: bool,
    pub response: Option<T>,
}

impl<T> FallbackResult<T> {
    fn not_attempted(primary_model: &str) -> Self {
        Self {
            success: false,
            final_model: primary_model.to_string(),
            attempts: Vec::new(),
            fallbacks_used: 0,
            circuit_breaker_triggered: false,
            response: None,
        }
    }
}

// ============================================================================
// Fallback Chain
// ============================================================================

/// Rule table, breaker table and the fallback walk
pub struct ModelFallbackChain {
    rules: RwLock<HashMap<String, FallbackRule>>,
    breakers: CircuitBreakers,
    registry: Arc<dyn ModelRegistry>,
    health: Option<Arc<ProviderHealthMonitor>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ModelFallbackChain {
    pub fn new(registry: Arc<dyn ModelRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            breakers: CircuitBreakers::new(),
            registry,
            health: None,
            metrics,
        }
    }

    /// Skip candidates whose provider the monitor reports as unavailable
    #[must_use]
    pub fn with_health_monitor(mut self, health: Arc<ProviderHealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn add_rule(&self, rule: FallbackRule) -> Result<(), FallbackError> {
        rule.validate()?;

        let mut rules = self.rules.write();
        if rules.contains_key(&rule.primary_model) {
            return Err(FallbackError::RuleExists {
                model: rule.primary_model,
            });
        }
        tracing::debug!(
            primary = %rule.primary_model,
            fallbacks = ?rule.fallback_models,
            "Fallback rule added"
        );
        rules.insert(rule.primary_model.clone(), rule);
        Ok(())
    }

    pub fn update_rule(&self, rule: FallbackRule) -> Result<(), FallbackError> {
        rule.validate()?;

        let mut rules = self.rules.write();
        match rules.get_mut(&rule.primary_model) {
            Some(existing) => {
                *existing = rule;
                Ok(())
            }
            None => Err(FallbackError::RuleNotFound {
                model: rule.primary_model,
            }),
        }
    }

    pub fn remove_rule(&self, primary_model: &str) -> Result<FallbackRule, FallbackError> {
        self.rules
            .write()
            .remove(primary_model)
            .ok_or_else(|| FallbackError::RuleNotFound {
                model: primary_model.to_string(),
            })
    }

    pub fn get_rule(&self, primary_model: &str) -> Option<FallbackRule> {
        self.rules.read().get(primary_model).cloned()
    }

    /// All rules sorted by primary model
    pub fn rules(&self) -> Vec<FallbackRule> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.primary_model.cmp(&b.primary_model));
        rules
    }

    pub fn get_circuit_breaker_state(&self, model: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(model)
    }

    pub fn all_circuit_breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.breakers.all()
    }

    pub fn is_circuit_open(&self, model: &str) -> bool {
        self.breakers.is_open(model)
    }

    pub fn reset_circuit_breaker(&self, model: &str) -> bool {
        let reset = self.breakers.reset(model);
        if reset {
            tracing::info!(model = %model, "Circuit breaker reset");
        }
        reset
    }

    pub fn reset_all_circuit_breakers(&self) {
        self.breakers.reset_all();
        tracing::info!("All circuit breakers reset");
    }

    /// Walk the fallback chain after `primary_model` failed with `error`
    ///
    /// `execute` performs the real call for a candidate. Failures are
    /// reported through the result, never as an error.
    pub async fn execute_fallback<T, F, Fut>(
        &self,
        primary_model: &str,
        error: &ProviderError,
        requirements: Option<&ModelRequirements>,
        mut execute: F,
    ) -> FallbackResult<T>
    where
        F: FnMut(ProviderModel) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let rule = {
            let rules = self.rules.read();
            rules.get(primary_model).filter(|r| r.enabled).cloned()
        };
        let Some(rule) = rule else {
            tracing::debug!(model = %primary_model, "No enabled fallback rule");
            return FallbackResult::not_attempted(primary_model);
        };
        if !rule.matches(error) {
            tracing::debug!(model = %primary_model, error = %error, "Error does not match fallback conditions");
            return FallbackResult::not_attempted(primary_model);
        }

        let threshold = rule.circuit_breaker_threshold;
        let breaker_timeout = rule.circuit_breaker_timeout();

        let mut attempts = vec![FallbackAttempt {
            attempt_number: 0,
            model: primary_model.to_string(),
            provider: self.registry.get_model(primary_model).map(|m| m.provider),
            success: false,
            latency: Duration::ZERO,
            error: Some(error.clone()),
            timestamp: Utc::now(),
        }];
        self.record_breaker_failure(primary_model, threshold, breaker_timeout);

        let mut executions = 0u32;
        let mut skipped_open = false;

        for candidate in &rule.fallback_models {
            if executions >= rule.max_retries {
                tracing::debug!(model = %primary_model, max_retries = rule.max_retries, "Fallback retry budget spent");
                break;
            }

            if self.breakers.is_open(candidate) {
                tracing::debug!(model = %candidate, "Skipping fallback, circuit open");
                skipped_open = true;
                continue;
            }

            let Some(info) = self.eligible(candidate, requirements) else {
                continue;
            };

            if executions > 0 && rule.retry_delay_ms > 0 {
                // Delay between fallback retry attempts
                tokio::time::sleep(rule.retry_delay()).await;
            }
            executions += 1;

            let target = ProviderModel::new(&info.provider, candidate);
            let started = Instant::now();
            let outcome = execute(target).await;
            let latency = started.elapsed();

            let attempt_number = attempts.len() as u32;
            match outcome {
                Ok(response) => {
                    self.breakers.record_success(candidate);
                    self.metrics.increment_counter(
                        "fallback_attempts_total",
                        &[("model", candidate.as_str()), ("outcome", "success")],
                        1,
                    );
                    attempts.push(FallbackAttempt {
                        attempt_number,
                        model: candidate.clone(),
                        provider: Some(info.provider),
                        success: true,
                        latency,
                        error: None,
                        timestamp: Utc::now(),
                    });
                    tracing::info!(
                        primary = %primary_model,
                        model = %candidate,
                        fallbacks_used = executions,
                        "Fallback succeeded"
                    );
                    return FallbackResult {
                        success: true,
                        final_model: candidate.clone(),
                        attempts,
                        fallbacks_used: executions,
                        circuit_breaker_triggered: false,
                        response: Some(response),
                    };
                }
                Err(e) => {
                    tracing::debug!(model = %candidate, error = %e, "Fallback attempt failed");
                    self.record_breaker_failure(candidate, threshold, breaker_timeout);
                    self.metrics.increment_counter(
                        "fallback_attempts_total",
                        &[("model", candidate.as_str()), ("outcome", "failure")],
                        1,
                    );
                    attempts.push(FallbackAttempt {
                        attempt_number,
                        model: candidate.clone(),
                        provider: Some(info.provider),
                        success: false,
                        latency,
                        error: Some(e),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        self.metrics
            .increment_counter("fallback_exhausted_total", &[("model", primary_model)], 1);
        tracing::warn!(
            primary = %primary_model,
            attempts = attempts.len(),
            circuit_breaker_triggered = skipped_open,
            "Fallback chain exhausted"
        );

        FallbackResult {
            success: false,
            final_model: primary_model.to_string(),
            attempts,
            fallbacks_used: executions,
            circuit_breaker_triggered: skipped_open,
            response: None,
        }
    }

    /// Registry, requirement and provider-health checks for one candidate
    fn eligible(&self, candidate: &str, requirements: Option<&ModelRequirements>) -> Option<ModelInfo> {
        let Some(info) = self.registry.get_model(candidate) else {
            tracing::debug!(model = %candidate, "Skipping fallback, unknown model");
            return None;
        };
        if !info.available {
            tracing::debug!(model = %candidate, "Skipping fallback, model unavailable");
            return None;
        }
        if requirements.is_some_and(|r| !r.is_satisfied_by(&info)) {
            tracing::debug!(model = %candidate, "Skipping fallback, requirements not met");
            return None;
        }
        if let Some(health) = &self.health {
            if !health.is_provider_available(&info.provider) {
                tracing::debug!(model = %candidate, provider = %info.provider, "Skipping fallback, provider unavailable");
                return None;
            }
        }
        Some(info)
    }

    fn record_breaker_failure(&self, model: &str, threshold: u32, timeout: Duration) {
        if self.breakers.record_failure(model, threshold, timeout) {
            self.metrics
                .increment_counter("circuit_breaker_opened_total", &[("model", model)], 1);
        }
    }
}

impl std::fmt::Debug for ModelFallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelFallbackChain")
            .field("rules", &self.rules.read().len())
            .field("breakers", &self.breakers.all().len())
            .field("health_aware", &self.health.is_some())
            .finish()
    }
}
