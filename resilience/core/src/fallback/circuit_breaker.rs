//! Per-model circuit breakers
//!
//! ```text
//! +--------+   failures >= threshold   +------+   now >= next_retry   +-----------+
//! | Closed | ------------------------> | Open | --------------------> | Half-Open |
//! +--------+                           +------+     (on query)        +-----------+
//!     ^                                    ^                               |
//!     |              success               |            failure            |
//!     +------------------------------------+-------------------------------+
//! ```
//!
//! There is no timer: the open to half-open step happens lazily the first
//! time [`CircuitBreakers::is_open`] is asked after the cool-down. Thresholds
//! and timeouts come from the fallback rule that drives the call, so the
//! breakers themselves carry no configuration.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one model's breaker
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerState {
    pub model: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub next_retry_time: Option<Instant>,
}

impl CircuitBreakerState {
    fn closed(model: &str) -> Self {
        Self {
            model: model.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_retry_time: None,
        }
    }

    /// Time left until an open breaker admits a trial
    pub fn retry_in(&self) -> Option<Duration> {
        match (self.state, self.next_retry_time) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}

/// Breaker table keyed by model id
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    states: DashMap<String, CircuitBreakerState>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether calls to `model` must be skipped
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open here and
    /// reports not-open. Unknown models are closed.
    pub fn is_open(&self, model: &str) -> bool {
        let Some(mut entry) = self.states.get_mut(model) else {
            return false;
        };

        if entry.state == CircuitState::Open {
            let due = entry.next_retry_time.map_or(true, |at| Instant::now() >= at);
            if due {
                entry.state = CircuitState::HalfOpen;
                tracing::info!(model = %model, "Circuit breaker half-open, allowing trial");
            }
        }

        entry.state == CircuitState::Open
    }

    /// Close the breaker after a successful call
    pub fn record_success(&self, model: &str) {
        if let Some(mut entry) = self.states.get_mut(model) {
            if entry.state != CircuitState::Closed {
                tracing::info!(model = %model, previous = %entry.state, "Circuit breaker closed");
            }
            entry.state = CircuitState::Closed;
            entry.failure_count = 0;
            entry.next_retry_time = None;
        }
    }

    /// Count a failure; returns true if this failure opened the breaker
    pub fn record_failure(&self, model: &str, threshold: u32, timeout: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self
            .states
            .entry(model.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(model));

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_time = Some(now);

        // An open breaker past its cool-down is re-armed as well, even if no
        // caller has moved it to half-open yet
        let armed = entry.state == CircuitState::Open
            && entry.next_retry_time.is_some_and(|at| now < at);

        if entry.failure_count >= threshold && !armed {
            entry.state = CircuitState::Open;
            entry.next_retry_time = Some(now + timeout);
            tracing::warn!(
                model = %model,
                failures = entry.failure_count,
                timeout_ms = timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn get(&self, model: &str) -> Option<CircuitBreakerState> {
        self.states.get(model).map(|s| s.clone())
    }

    /// All breakers sorted by model id
    pub fn all(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.states.iter().map(|s| s.value().clone()).collect();
        states.sort_by(|a, b| a.model.cmp(&b.model));
        states
    }

    /// Force a breaker closed; false if the model has no breaker
    pub fn reset(&self, model: &str) -> bool {
        match self.states.get_mut(model) {
            Some(mut entry) => {
                *entry = CircuitBreakerState::closed(model);
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for mut entry in self.states.iter_mut() {
            let model = entry.key().clone();
            *entry = CircuitBreakerState::closed(&model);
        }
    }
}
