//! Provider Health Monitor
//!
//! Tracks rolling availability, latency and error rate per provider and
//! classifies each provider as healthy, degraded, unhealthy or offline.
//!
//! # Architecture
//!
//! ```text
//! request outcome ──┐
//!                   ├──> record_request() ──> per-provider sample window
//! probe outcome ────┘          │                  (pruned to metrics_window)
//!                              v
//!                    availability / p95 / SLA ──> classify ──> status
//!                              │
//!                              └──> MetricsSink gauges, tracing on change
//! ```
//!
//! # Classification
//!
//! First match wins:
//! 1. `consecutive_failures >= unhealthy_threshold` => Unhealthy
//! 2. `error_rate >= unhealthy_error_rate` => Unhealthy
//! 3. `error_rate >= degraded_error_rate` => Degraded
//! 4. `p95 >= unhealthy_latency` => Unhealthy
//! 5. `p95 >= degraded_latency` => Degraded
//! 6. otherwise Healthy
//!
//! A provider whose last success is older than `metrics_window` is reported
//! Offline regardless of the above.
//!
//! # Thread Safety
//!
//! Provider state lives in a `DashMap`; every update runs under that
//! provider's shard lock, so concurrent `record_request` calls for the same
//! provider are serialized while different providers proceed in parallel.

mod probe;

pub use probe::{HealthProbe, HttpHealthProbe, ProbeError};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::metrics::MetricsSink;
use crate::task::BackgroundTask;
use crate::types::FailureReason;

// ============================================================================
// Health Status
// ============================================================================

/// Health status of a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl ProviderStatus {
    /// Whether requests may still be routed to the provider
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for provider health tracking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between synthetic health probes
    pub health_check_interval_ms: u64,

    /// Upper bound for a single probe
    pub health_check_timeout_ms: u64,

    /// Consecutive failures that force Unhealthy
    pub unhealthy_threshold: u32,

    /// Error rate at which a provider becomes Degraded (0.0 - 1.0)
    pub degraded_error_rate: f64,

    /// Error rate at which a provider becomes Unhealthy (0.0 - 1.0)
    pub unhealthy_error_rate: f64,

    /// p95 latency at which a provider becomes Degraded
    pub degraded_latency_ms: u64,

    /// p95 latency at which a provider becomes Unhealthy
    pub unhealthy_latency_ms: u64,

    /// Length of the rolling sample window
    pub metrics_window_ms: u64,

    /// Availability target used for SLA compliance (0.0 - 1.0)
    pub sla_target: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 60_000,
            health_check_timeout_ms: 5_000,
            unhealthy_threshold: 5,
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.15,
            degraded_latency_ms: 5_000,
            unhealthy_latency_ms: 10_000,
            metrics_window_ms: 5 * 60 * 1000,
            sla_target: 0.999,
        }
    }
}

impl HealthConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_millis(self.metrics_window_ms)
    }

    #[must_use]
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_error_rates(mut self, degraded: f64, unhealthy: f64) -> Self {
        self.degraded_error_rate = degraded;
        self.unhealthy_error_rate = unhealthy;
        self
    }

    #[must_use]
    pub fn with_latency_thresholds(mut self, degraded_ms: u64, unhealthy_ms: u64) -> Self {
        self.degraded_latency_ms = degraded_ms;
        self.unhealthy_latency_ms = unhealthy_ms;
        self
    }

    #[must_use]
    pub fn with_metrics_window(mut self, window: Duration) -> Self {
        self.metrics_window_ms = window.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

// ============================================================================
// Provider Metrics
// ============================================================================

/// Point-in-time health metrics for one provider
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderHealthMetrics {
    pub provider: String,
    pub status: ProviderStatus,

    /// Successes / total over the current window
    pub availability: f64,

    /// `1 - availability` over the same window
    pub error_rate: f64,

    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,

    /// Lifetime counters
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_count: u64,
    pub rate_limit_count: u64,

    pub consecutive_failures: u32,
    pub sla_compliance: f64,

    /// Samples currently inside the window
    pub window_samples: usize,

    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_reason: Option<FailureReason>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ProviderHealthMetrics {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: ProviderStatus::Healthy,
            availability: 1.0,
            error_rate: 0.0,
            avg_latency_ms: 0.0,
            p95_latency_ms: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            timeout_count: 0,
            rate_limit_count: 0,
            consecutive_failures: 0,
            sla_compliance: 1.0,
            window_samples: 0,
            last_success: None,
            last_error: None,
            last_error_reason: None,
            last_health_check: None,
        }
    }
}

/// Aggregate view across all tracked providers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_providers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub offline: usize,

    /// Mean availability; 1.0 when nothing is tracked
    pub average_availability: f64,

    /// Mean SLA compliance; 1.0 when nothing is tracked
    pub average_sla_compliance: f64,
}

// ============================================================================
// Per-Provider State
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct RequestSample {
    success: bool,
    latency_ms: u64,
    at: Instant,
}

#[derive(Debug)]
struct ProviderState {
    samples: VecDeque<RequestSample>,
    metrics: ProviderHealthMetrics,

    /// Baseline for the offline check until the first success
    tracked_since: Instant,
    last_success_at: Option<Instant>,
}

impl ProviderState {
    fn new(provider: &str, now: Instant) -> Self {
        Self {
            samples: VecDeque::new(),
            metrics: ProviderHealthMetrics::new(provider),
            tracked_since: now,
            last_success_at: None,
        }
    }

    fn record(
        &mut self,
        now: Instant,
        success: bool,
        latency: Duration,
        failure: Option<FailureReason>,
        config: &HealthConfig,
    ) {
        let window = config.metrics_window();
        let latency_ms = latency.as_millis() as u64;

        self.samples.push_back(RequestSample {
            success,
            latency_ms,
            at: now,
        });
        while self
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > window)
        {
            self.samples.pop_front();
        }

        let m = &mut self.metrics;
        m.total_requests += 1;
        if success {
            m.successful_requests += 1;
            m.consecutive_failures = 0;
            m.last_success = Some(Utc::now());
            self.last_success_at = Some(now);
        } else {
            m.failed_requests += 1;
            m.consecutive_failures = m.consecutive_failures.saturating_add(1);
            m.last_error = Some(Utc::now());
            m.last_error_reason = failure;
            match failure {
                Some(FailureReason::Timeout) => m.timeout_count += 1,
                Some(FailureReason::RateLimit) => m.rate_limit_count += 1,
                _ => {}
            }
        }

        let total = self.samples.len();
        let successes = self.samples.iter().filter(|s| s.success).count();
        m.window_samples = total;
        m.availability = successes as f64 / total as f64;
        m.error_rate = 1.0 - m.availability;

        let mut latencies: Vec<u64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        m.avg_latency_ms = latencies.iter().sum::<u64>() as f64 / total as f64;
        let p95_idx = ((total as f64 * 0.95).floor() as usize).min(total - 1);
        m.p95_latency_ms = latencies[p95_idx];

        m.sla_compliance = if m.availability >= config.sla_target {
            1.0
        } else {
            m.availability / config.sla_target
        };

        let since_success = now.duration_since(self.last_success_at.unwrap_or(self.tracked_since));
        m.status = if since_success > window {
            ProviderStatus::Offline
        } else {
            classify(m, config)
        };
    }
}

/// Status from window metrics, in fixed precedence order
fn classify(metrics: &ProviderHealthMetrics, config: &HealthConfig) -> ProviderStatus {
    if metrics.consecutive_failures >= config.unhealthy_threshold {
        ProviderStatus::Unhealthy
    } else if metrics.error_rate >= config.unhealthy_error_rate {
        ProviderStatus::Unhealthy
    } else if metrics.error_rate >= config.degraded_error_rate {
        ProviderStatus::Degraded
    } else if metrics.p95_latency_ms >= config.unhealthy_latency_ms {
        ProviderStatus::Unhealthy
    } else if metrics.p95_latency_ms >= config.degraded_latency_ms {
        ProviderStatus::Degraded
    } else {
        ProviderStatus::Healthy
    }
}

// ============================================================================
// Provider Health Monitor
// ============================================================================

/// Tracks health for every provider the gateway talks to
pub struct ProviderHealthMonitor {
    config: HealthConfig,
    providers: DashMap<String, ProviderState>,
    metrics: Arc<dyn MetricsSink>,
}

impl ProviderHealthMonitor {
    /// Create a monitor tracking the given providers from now on
    pub fn new<I, S>(config: HealthConfig, providers: I, metrics: Arc<dyn MetricsSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Instant::now();
        let map = DashMap::new();
        for provider in providers {
            let provider = provider.into();
            let state = ProviderState::new(&provider, now);
            map.insert(provider, state);
        }

        Self {
            config,
            providers: map,
            metrics,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking a provider; no-op if already tracked
    pub fn register_provider(&self, provider: impl Into<String>) {
        let provider = provider.into();
        self.providers
            .entry(provider.clone())
            .or_insert_with(|| ProviderState::new(&provider, Instant::now()));
    }

    /// Record the outcome of one request (or probe) against a provider
    ///
    /// Unknown providers are tracked from this call onwards. Returns the
    /// provider's status after the update.
    pub fn record_request(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
        failure: Option<FailureReason>,
    ) -> ProviderStatus {
        let now = Instant::now();

        let (previous, snapshot) = {
            let mut entry = self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| ProviderState::new(provider, now));
            let state = entry.value_mut();
            let previous = state.metrics.status;
            state.record(now, success, latency, failure, &self.config);
            (previous, state.metrics.clone())
        };

        self.emit(&snapshot, success, latency);

        if previous != snapshot.status {
            match snapshot.status {
                ProviderStatus::Unhealthy | ProviderStatus::Offline => tracing::warn!(
                    provider = %provider,
                    from = %previous,
                    to = %snapshot.status,
                    error_rate = snapshot.error_rate,
                    p95_latency_ms = snapshot.p95_latency_ms,
                    consecutive_failures = snapshot.consecutive_failures,
                    "Provider health degraded"
                ),
                _ => tracing::info!(
                    provider = %provider,
                    from = %previous,
                    to = %snapshot.status,
                    error_rate = snapshot.error_rate,
                    p95_latency_ms = snapshot.p95_latency_ms,
                    "Provider health changed"
                ),
            }
        }

        snapshot.status
    }

    fn emit(&self, m: &ProviderHealthMetrics, success: bool, latency: Duration) {
        let provider = m.provider.as_str();
        let outcome = if success { "success" } else { "failure" };

        self.metrics.increment_counter(
            "provider_requests_total",
            &[("provider", provider), ("outcome", outcome)],
            1,
        );
        self.metrics.record_histogram(
            "provider_request_latency_ms",
            &[("provider", provider)],
            latency.as_millis() as f64,
        );
        let labels = [("provider", provider)];
        self.metrics
            .set_gauge("provider_availability", &labels, m.availability);
        self.metrics
            .set_gauge("provider_error_rate", &labels, m.error_rate);
        self.metrics
            .set_gauge("provider_p95_latency_ms", &labels, m.p95_latency_ms as f64);
        self.metrics
            .set_gauge("provider_sla_compliance", &labels, m.sla_compliance);
    }

    /// Stamp the last health-check time for a provider
    fn mark_health_check(&self, provider: &str) {
        if let Some(mut state) = self.providers.get_mut(provider) {
            state.metrics.last_health_check = Some(Utc::now());
        }
    }

    /// True only for tracked providers currently Healthy
    pub fn is_provider_healthy(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|s| s.metrics.status == ProviderStatus::Healthy)
    }

    /// True for Healthy or Degraded providers, and for providers never seen
    pub fn is_provider_available(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map_or(true, |s| s.metrics.status.is_available())
    }

    pub fn get_provider_metrics(&self, provider: &str) -> Option<ProviderHealthMetrics> {
        self.providers.get(provider).map(|s| s.metrics.clone())
    }

    /// Metrics for every tracked provider, sorted by name
    pub fn all_provider_metrics(&self) -> Vec<ProviderHealthMetrics> {
        let mut all: Vec<_> = self
            .providers
            .iter()
            .map(|s| s.metrics.clone())
            .collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Tracked provider names, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let all = self.all_provider_metrics();
        let count_of = |status: ProviderStatus| all.iter().filter(|m| m.status == status).count();

        let (average_availability, average_sla_compliance) = if all.is_empty() {
            (1.0, 1.0)
        } else {
            let n = all.len() as f64;
            (
                all.iter().map(|m| m.availability).sum::<f64>() / n,
                all.iter().map(|m| m.sla_compliance).sum::<f64>() / n,
            )
        };

        HealthSummary {
            total_providers: all.len(),
            healthy: count_of(ProviderStatus::Healthy),
            degraded: count_of(ProviderStatus::Degraded),
            unhealthy: count_of(ProviderStatus::Unhealthy),
            offline: count_of(ProviderStatus::Offline),
            average_availability,
            average_sla_compliance,
        }
    }

    // ------------------------------------------------------------------------
    // Background health checks
    // ------------------------------------------------------------------------

    /// Start probing every tracked provider on `health_check_interval`
    ///
    /// Providers are probed concurrently, each bounded by
    /// `health_check_timeout`. A slow or failing probe never delays the
    /// others. The returned handle owns the schedule.
    pub fn start_health_checks(self: &Arc<Self>, probe: Arc<dyn HealthProbe>) -> BackgroundTask {
        let monitor = Arc::clone(self);
        BackgroundTask::spawn_interval(
            "provider-health-checks",
            self.config.health_check_interval(),
            move || {
                let monitor = Arc::clone(&monitor);
                let probe = Arc::clone(&probe);
                async move {
                    monitor.run_health_checks(probe).await;
                    Ok(())
                }
            },
        )
    }

    /// Probe every tracked provider once and record the outcomes
    pub async fn run_health_checks(&self, probe: Arc<dyn HealthProbe>) {
        let timeout = self.config.health_check_timeout();

        stream::iter(self.providers())
            .for_each_concurrent(None, |provider| {
                let probe = Arc::clone(&probe);
                async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(timeout, probe.probe(&provider)).await;
                    let elapsed = started.elapsed();

                    match outcome {
                        Ok(Ok(())) => {
                            self.record_request(&provider, true, elapsed, None);
                        }
                        Ok(Err(ProbeError::Unsupported(_))) => return,
                        Ok(Err(e)) => {
                            tracing::debug!(provider = %provider, error = %e, "Health probe failed");
                            self.record_request(&provider, false, elapsed, Some(e.reason()));
                        }
                        Err(_) => {
                            tracing::debug!(provider = %provider, timeout_ms = timeout.as_millis() as u64, "Health probe timed out");
                            self.record_request(
                                &provider,
                                false,
                                elapsed,
                                Some(FailureReason::Timeout),
                            );
                        }
                    }
                    self.mark_health_check(&provider);
                }
            })
            .await;
    }
}

impl std::fmt::Debug for ProviderHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealthMonitor")
            .field("config", &self.config)
            .field("providers", &self.providers())
            .finish()
    }
}
