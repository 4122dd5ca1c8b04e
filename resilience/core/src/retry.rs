//! Smart Retry
//!
//! Retries a provider call with exponential backoff and, for failures that
//! mean "this provider cannot serve you right now", rotates to the next
//! provider/model candidate.
//!
//! ```text
//! attempt 0..=max_retries:
//!     call candidates[index]  ──ok──> done
//!         | err
//!     classify -> FailureReason
//!     last attempt or not retryable? ──> give up with the error
//!     rate_limit / quota_exceeded / provider_unavailable?
//!         └─> index = (index + 1) % candidates.len()
//!     sleep(min(initial * multiplier^attempt, max) ± jitter)
//! ```
//!
//! Failures never escape as `Err`: the last provider error is carried in
//! [`RetryResult::outcome`] alongside the full attempt log. The only `Err`
//! is a misconfigured call with no candidates.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::metrics::MetricsSink;
use crate::types::{FailureReason, ProviderError, ProviderModel};

// ============================================================================
// Configuration
// ============================================================================

/// Backoff and retryability settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    pub initial_delay_ms: u64,

    pub max_delay_ms: u64,

    pub backoff_multiplier: f64,

    /// Fraction of the delay used as symmetric jitter (0.1 = ±5%)
    pub jitter_factor: f64,

    /// HTTP statuses below 500 that are still worth retrying
    pub retryable_status_codes: Vec<u16>,

    pub retryable_reasons: BTreeSet<FailureReason>,

    /// Rotate candidates on rate limit, quota and availability failures
    pub enable_cross_provider_failover: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
            retryable_reasons: FailureReason::ALL.into_iter().collect(),
            enable_cross_provider_failover: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = initial.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    #[must_use]
    pub fn with_retryable_reasons<I>(mut self, reasons: I) -> Self
    where
        I: IntoIterator<Item = FailureReason>,
    {
        self.retryable_reasons = reasons.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_cross_provider_failover(mut self, enabled: bool) -> Self {
        self.enable_cross_provider_failover = enabled;
        self
    }

    /// Whether a failure classified as `reason` may be retried
    pub fn is_retryable(&self, error: &ProviderError, reason: FailureReason) -> bool {
        if !self.retryable_reasons.contains(&reason) {
            return false;
        }
        match error.status {
            Some(status) => status >= 500 || self.retryable_status_codes.contains(&status),
            None => true,
        }
    }

    /// Backoff for attempt N (0-indexed) given a uniform sample in [0, 1)
    pub fn backoff_delay(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter_factor * (sample - 0.5);

        Duration::from_millis((capped + jitter).max(0.0).round() as u64)
    }
}

/// Per-call overrides
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Abandon an attempt that takes longer than this
    pub timeout: Option<Duration>,

    /// Overrides [`RetryConfig::max_retries`]
    pub max_retries: Option<u32>,
}

impl RetryOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// A failed attempt
#[derive(Clone, Debug, Serialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub provider: String,
    pub model: String,
    pub reason: FailureReason,
    pub error: ProviderError,
    /// Backoff slept after this attempt (0 for the final one)
    pub delay_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`SmartRetry::execute`]
#[derive(Debug)]
pub struct RetryResult<T> {
    /// Response, or the error from the last attempt
    pub outcome: Result<T, ProviderError>,

    /// Failed attempts, in order
    pub attempts: Vec<RetryAttempt>,

    pub total_duration: Duration,

    /// Candidate used by the final attempt
    pub final_provider: ProviderModel,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("no provider/model candidates supplied")]
    NoCandidates,
}

// ============================================================================
// Smart Retry
// ============================================================================

/// Retry executor
pub struct SmartRetry {
    config: RetryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl SmartRetry {
    pub fn new(config: RetryConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` against `candidates` until it succeeds or retries run out
    ///
    /// The calling task sleeps between attempts; nothing else is blocked. A
    /// timed-out attempt is dropped, so the operation must tolerate being
    /// cancelled at an await point.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        candidates: &[ProviderModel],
        options: RetryOptions,
    ) -> Result<RetryResult<T>, RetryError>
    where
        F: FnMut(ProviderModel) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if candidates.is_empty() {
            return Err(RetryError::NoCandidates);
        }

        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut index = 0usize;
        let mut attempt = 0u32;

        loop {
            let target = candidates[index].clone();
            let call = operation(target.clone());
            let outcome = match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProviderError::new(format!(
                        "Request timed out after {}ms",
                        limit.as_millis()
                    ))
                    .with_reason(FailureReason::Timeout)),
                },
                None => call.await,
            };

            let error = match outcome {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = %target.provider,
                            model = %target.model,
                            attempts = attempt + 1,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(RetryResult {
                        outcome: Ok(response),
                        attempts,
                        total_duration: started.elapsed(),
                        final_provider: target,
                    });
                }
                Err(e) => e,
            };

            let reason = error.classify();
            self.metrics
                .increment_counter("retry_attempts_total", &[("reason", reason.as_str())], 1);

            let retryable = self.config.is_retryable(&error, reason);
            let give_up = attempt >= max_retries || !retryable;
            let delay = if give_up {
                Duration::ZERO
            } else {
                self.next_delay(attempt)
            };

            tracing::debug!(
                provider = %target.provider,
                model = %target.model,
                attempt,
                reason = %reason,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed"
            );

            attempts.push(RetryAttempt {
                attempt_number: attempt,
                provider: target.provider.clone(),
                model: target.model.clone(),
                reason,
                error: error.clone(),
                delay_ms: delay.as_millis() as u64,
                timestamp: Utc::now(),
            });

            if give_up {
                self.metrics.increment_counter("retry_exhausted_total", &[], 1);
                tracing::warn!(
                    provider = %target.provider,
                    model = %target.model,
                    attempts = attempts.len(),
                    reason = %reason,
                    retryable,
                    "Giving up on request"
                );
                return Ok(RetryResult {
                    outcome: Err(error),
                    attempts,
                    total_duration: started.elapsed(),
                    final_provider: target,
                });
            }

            if self.config.enable_cross_provider_failover && reason.triggers_failover() {
                index = (index + 1) % candidates.len();
                if candidates.len() > 1 {
                    self.metrics.increment_counter("retry_failovers_total", &[], 1);
                    tracing::info!(
                        from = %target,
                        to = %candidates[index],
                        reason = %reason,
                        "Failing over to next provider"
                    );
                }
            }

            // Backoff before the next retry attempt
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::random::<f64>();
        self.config.backoff_delay(attempt, sample)
    }
}

impl std::fmt::Debug for SmartRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartRetry").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetrics, NoopMetrics};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn candidates() -> Vec<ProviderModel> {
        vec![
            ProviderModel::new("openai", "gpt-4"),
            ProviderModel::new("anthropic", "claude-3-opus"),
        ]
    }

    fn retry(config: RetryConfig) -> SmartRetry {
        SmartRetry::new(config, NoopMetrics::shared())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_failures() {
        let retry = retry(RetryConfig::default().with_max_retries(3));
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ProviderError::http(500, "internal server error"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                &candidates()[..1],
                RetryOptions::default(),
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.outcome.unwrap(), "done");
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts.iter().all(|a| a.reason == FailureReason::ServerError));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_computed_backoff() {
        let retry = retry(RetryConfig::default().with_jitter_factor(0.0));
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ProviderError::new("upstream exploded"))
                        } else {
                            Ok(())
                        }
                    }
                },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();

        let delays: Vec<_> = result.attempts.iter().map(|a| a.delay_ms).collect();
        assert_eq!(delays, vec![1000, 2000]);
        assert_eq!(result.total_duration, Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let sink = Arc::new(InMemoryMetrics::new());
        let retry = SmartRetry::new(RetryConfig::default().with_max_retries(2), sink.clone());

        let result = retry
            .execute(
                |_| async { Err::<(), _>(ProviderError::http(502, "bad gateway")) },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts.last().unwrap().delay_ms, 0);
        assert_eq!(result.outcome.unwrap_err().status, Some(502));
        // Server errors retry in place
        assert_eq!(result.final_provider, candidates()[0]);

        assert_eq!(sink.counter("retry_attempts_total", &[("reason", "server_error")]), 3);
        assert_eq!(sink.counter_total("retry_exhausted_total"), 1);
        assert_eq!(sink.counter_total("retry_failovers_total"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let retry = retry(RetryConfig::default());

        let result = retry
            .execute(
                |_| async { Err::<(), _>(ProviderError::http(400, "invalid request body")) },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 1);

        let retry = self::retry(
            RetryConfig::default().with_retryable_reasons([FailureReason::RateLimit]),
        );
        let result = retry
            .execute(
                |_| async { Err::<(), _>(ProviderError::new("ECONNREFUSED 10.0.0.1:443")) },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].reason, FailureReason::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fails_over() {
        let sink = Arc::new(InMemoryMetrics::new());
        let retry = SmartRetry::new(RetryConfig::default(), sink.clone());

        let result = retry
            .execute(
                |target| async move {
                    if target.provider == "openai" {
                        Err(ProviderError::http(429, "rate limit exceeded"))
                    } else {
                        Ok(target.model)
                    }
                },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome.as_deref(), Ok("claude-3-opus"));
        assert_eq!(result.final_provider.provider, "anthropic");
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].provider, "openai");
        assert_eq!(sink.counter_total("retry_failovers_total"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_wraps_around() {
        let retry = retry(RetryConfig::default().with_max_retries(4));
        let seen = parking_lot::Mutex::new(Vec::new());

        let result = retry
            .execute(
                |target| {
                    seen.lock().push(target.provider.clone());
                    async { Err::<(), _>(ProviderError::new("provider unavailable")) }
                },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(
            *seen.lock(),
            vec!["openai", "anthropic", "openai", "anthropic", "openai"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_disabled_stays_put() {
        let retry = retry(
            RetryConfig::default()
                .with_max_retries(2)
                .with_cross_provider_failover(false),
        );

        let result = retry
            .execute(
                |_| async { Err::<(), _>(ProviderError::http(429, "slow down")) },
                &candidates(),
                RetryOptions::default(),
            )
            .await
            .unwrap();

        assert!(result.attempts.iter().all(|a| a.provider == "openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let retry = retry(RetryConfig::default().with_jitter_factor(0.0));

        let result = retry
            .execute(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, ProviderError>(())
                },
                &candidates(),
                RetryOptions::default()
                    .with_timeout(Duration::from_secs(1))
                    .with_max_retries(1),
            )
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts.iter().all(|a| a.reason == FailureReason::Timeout));
        // Two 1s timeouts plus one 1s backoff
        assert_eq!(result.total_duration, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let retry = retry(RetryConfig::default());
        let result = retry
            .execute(
                |_| async { Ok::<_, ProviderError>(()) },
                &[],
                RetryOptions::default(),
            )
            .await;
        assert_eq!(result.unwrap_err(), RetryError::NoCandidates);
    }

    #[test]
    fn test_backoff_bounds() {
        let config = RetryConfig::default();
        let ceiling = config.max_delay_ms as f64 * (1.0 + config.jitter_factor / 2.0);

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            for sample in [0.0, 0.25, 0.5, 0.75, 0.999_999] {
                let delay = config.backoff_delay(attempt, sample);
                assert!(delay.as_millis() as f64 <= ceiling.round(), "attempt {attempt}: {delay:?}");
            }
            // Midpoint sample is the expected value
            let expected = config.backoff_delay(attempt, 0.5);
            assert!(expected >= previous);
            previous = expected;
        }

        assert_eq!(config.backoff_delay(0, 0.5), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(3, 0.5), Duration::from_millis(8000));
        assert_eq!(config.backoff_delay(10, 0.5), Duration::from_millis(30_000));
        assert_eq!(config.backoff_delay(0, 0.0), Duration::from_millis(950));
    }

    #[test]
    fn test_retryable_status() {
        let config = RetryConfig::default();
        let reason = FailureReason::ServerError;
        assert!(config.is_retryable(&ProviderError::http(500, "x"), reason));
        assert!(config.is_retryable(&ProviderError::http(599, "x"), reason));
        assert!(config.is_retryable(&ProviderError::http(429, "x"), FailureReason::RateLimit));
        assert!(!config.is_retryable(&ProviderError::http(404, "x"), reason));
        assert!(config.is_retryable(&ProviderError::new("x"), reason));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RetryConfig = toml::from_str(
            r#"
            max_retries = 5
            retryable_reasons = ["rate_limit", "timeout"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert_eq!(config.retryable_reasons.len(), 2);
        assert!(config.enable_cross_provider_failover);
    }
}
