//! Provider Quota Manager
//!
//! Tracks request and token usage per provider (optionally per model) over
//! three independent windows and answers admission checks against the
//! configured limits.
//!
//! # Windows
//!
//! ```text
//!            reset_at              reset_at + len       reset_at + 2·len
//! minute ──────┼──────────────────────┼─────────────────────┼──────>
//! hour   ──────────────────────────────────────────┼────────────────>
//! day    ───────────────────────────────────────────────────────┼───>
//! ```
//!
//! Each window has its own reset instant. A window whose reset instant has
//! passed is zeroed on the next touch (or by the periodic sweep) and its
//! reset instant moves forward by whole window lengths, so long idle periods
//! still produce exactly one reset.
//!
//! # Key Resolution
//!
//! Limits configured for `(provider, model)` take precedence over limits for
//! `provider` alone. Usage is always counted under the key that owns the
//! limits, so provider-wide limits aggregate across models.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::metrics::MetricsSink;
use crate::task::BackgroundTask;

/// Exhaustion duration when the caller does not give one
pub const DEFAULT_EXHAUSTION: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// Keys and Windows
// ============================================================================

/// Quota key: a provider, or a specific model at a provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaKey {
    pub provider: String,
    pub model: Option<String>,
}

impl QuotaKey {
    /// Provider-wide key
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
        }
    }

    /// Model-specific key
    pub fn model(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: Some(model.into()),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{}/{}", self.provider, model),
            None => f.write_str(&self.provider),
        }
    }
}

/// One of the three usage windows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Minute,
    Hour,
    Day,
}

impl QuotaWindow {
    /// Windows in check order
    pub const ALL: [QuotaWindow; 3] = [QuotaWindow::Minute, QuotaWindow::Hour, QuotaWindow::Day];

    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(60 * 60),
            Self::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
        }
    }
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Configured limits for one key; `None` means unlimited
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,
}

impl QuotaLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_limit(&self, window: QuotaWindow) -> Option<u64> {
        match window {
            QuotaWindow::Minute => self.requests_per_minute,
            QuotaWindow::Hour => self.requests_per_hour,
            QuotaWindow::Day => self.requests_per_day,
        }
    }

    pub fn token_limit(&self, window: QuotaWindow) -> Option<u64> {
        match window {
            QuotaWindow::Minute => self.tokens_per_minute,
            QuotaWindow::Hour => self.tokens_per_hour,
            QuotaWindow::Day => self.tokens_per_day,
        }
    }

    #[must_use]
    pub fn with_requests_per_minute(mut self, limit: u64) -> Self {
        self.requests_per_minute = Some(limit);
        self
    }

    #[must_use]
    pub fn with_requests_per_hour(mut self, limit: u64) -> Self {
        self.requests_per_hour = Some(limit);
        self
    }

    #[must_use]
    pub fn with_requests_per_day(mut self, limit: u64) -> Self {
        self.requests_per_day = Some(limit);
        self
    }

    #[must_use]
    pub fn with_tokens_per_minute(mut self, limit: u64) -> Self {
        self.tokens_per_minute = Some(limit);
        self
    }

    #[must_use]
    pub fn with_tokens_per_hour(mut self, limit: u64) -> Self {
        self.tokens_per_hour = Some(limit);
        self
    }

    #[must_use]
    pub fn with_tokens_per_day(mut self, limit: u64) -> Self {
        self.tokens_per_day = Some(limit);
        self
    }
}

// ============================================================================
// Check Results
// ============================================================================

/// Remaining headroom per configured window; unconfigured windows are `None`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,
}

/// Outcome of an admission check
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaCheck {
    pub allowed: bool,

    /// Why the request was denied
    pub reason: Option<String>,

    /// Whole seconds until the blocking window resets
    pub retry_after_secs: Option<u64>,

    /// Headroom after this check (only populated when allowed)
    pub remaining: RemainingQuota,
}

impl QuotaCheck {
    fn allowed(remaining: RemainingQuota) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_secs: None,
            remaining,
        }
    }

    fn denied(reason: String, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_secs: Some(ceil_secs(retry_after)),
            remaining: RemainingQuota::default(),
        }
    }
}

/// Usage snapshot of one window
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub window: QuotaWindow,
    pub requests: u64,
    pub tokens: u64,
    pub request_limit: Option<u64>,
    pub token_limit: Option<u64>,
    pub resets_in_secs: u64,
}

/// Usage snapshot of one key
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub key: QuotaKey,
    pub windows: Vec<WindowStatus>,
    pub exhausted: bool,
    pub exhausted_for_secs: Option<u64>,
}

impl QuotaStatus {
    pub fn window(&self, window: QuotaWindow) -> Option<&WindowStatus> {
        self.windows.iter().find(|w| w.window == window)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    u64::try_from(d.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
}

// ============================================================================
// Per-Key State
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct WindowUsage {
    requests: u64,
    tokens: u64,
    reset_at: Instant,
}

impl WindowUsage {
    fn new(now: Instant, window: QuotaWindow) -> Self {
        Self {
            requests: 0,
            tokens: 0,
            reset_at: now + window.duration(),
        }
    }

    /// Zero the counters if the reset instant has passed
    fn reset_if_due(&mut self, now: Instant, window: QuotaWindow) -> bool {
        if now < self.reset_at {
            return false;
        }
        let len = window.duration();
        let missed = (now - self.reset_at).as_millis() / len.as_millis();
        let steps = u32::try_from(missed + 1).unwrap_or(u32::MAX);

        self.requests = 0;
        self.tokens = 0;
        self.reset_at += len * steps;
        true
    }
}

#[derive(Debug)]
struct QuotaState {
    windows: [WindowUsage; 3],
    exhausted_until: Option<Instant>,
}

impl QuotaState {
    fn new(now: Instant) -> Self {
        Self {
            windows: QuotaWindow::ALL.map(|w| WindowUsage::new(now, w)),
            exhausted_until: None,
        }
    }

    fn window(&self, window: QuotaWindow) -> &WindowUsage {
        &self.windows[window.index()]
    }

    fn reset_stale(&mut self, now: Instant) -> bool {
        let mut any = false;
        for window in QuotaWindow::ALL {
            any |= self.windows[window.index()].reset_if_due(now, window);
        }
        any
    }

    fn record(&mut self, tokens: Option<u64>) {
        for usage in &mut self.windows {
            usage.requests = usage.requests.saturating_add(1);
            if let Some(tokens) = tokens {
                usage.tokens = usage.tokens.saturating_add(tokens);
            }
        }
    }

    fn remaining(&self, limits: &QuotaLimits) -> RemainingQuota {
        let req = |w: QuotaWindow| {
            limits
                .request_limit(w)
                .map(|l| l.saturating_sub(self.window(w).requests))
        };
        let tok = |w: QuotaWindow| {
            limits
                .token_limit(w)
                .map(|l| l.saturating_sub(self.window(w).tokens))
        };
        RemainingQuota {
            requests_per_minute: req(QuotaWindow::Minute),
            requests_per_hour: req(QuotaWindow::Hour),
            requests_per_day: req(QuotaWindow::Day),
            tokens_per_minute: tok(QuotaWindow::Minute),
            tokens_per_hour: tok(QuotaWindow::Hour),
            tokens_per_day: tok(QuotaWindow::Day),
        }
    }

    /// Admission decision; resets stale windows and clears stale exhaustion
    fn evaluate(
        &mut self,
        now: Instant,
        limits: Option<&QuotaLimits>,
        estimated_tokens: Option<u64>,
    ) -> QuotaCheck {
        if let Some(until) = self.exhausted_until {
            if now < until {
                return QuotaCheck::denied("Quota exhausted".to_string(), until - now);
            }
            self.exhausted_until = None;
        }

        self.reset_stale(now);

        let Some(limits) = limits else {
            return QuotaCheck::allowed(RemainingQuota::default());
        };

        for window in QuotaWindow::ALL {
            if let Some(limit) = limits.request_limit(window) {
                let usage = self.window(window);
                if usage.requests.saturating_add(1) > limit {
                    return QuotaCheck::denied(
                        format!("Request quota exceeded for {window} window"),
                        usage.reset_at - now,
                    );
                }
            }
        }

        if let Some(tokens) = estimated_tokens {
            for window in QuotaWindow::ALL {
                if let Some(limit) = limits.token_limit(window) {
                    let usage = self.window(window);
                    if usage.tokens.saturating_add(tokens) > limit {
                        return QuotaCheck::denied(
                            format!("Token quota exceeded for {window} window"),
                            usage.reset_at - now,
                        );
                    }
                }
            }
        }

        QuotaCheck::allowed(self.remaining(limits))
    }

    fn status(&self, key: &QuotaKey, limits: Option<&QuotaLimits>, now: Instant) -> QuotaStatus {
        let exhausted_for = self
            .exhausted_until
            .filter(|until| now < *until)
            .map(|until| until - now);

        QuotaStatus {
            key: key.clone(),
            windows: QuotaWindow::ALL
                .iter()
                .map(|&w| {
                    let usage = self.window(w);
                    WindowStatus {
                        window: w,
                        requests: usage.requests,
                        tokens: usage.tokens,
                        request_limit: limits.and_then(|l| l.request_limit(w)),
                        token_limit: limits.and_then(|l| l.token_limit(w)),
                        resets_in_secs: ceil_secs(usage.reset_at.saturating_duration_since(now)),
                    }
                })
                .collect(),
            exhausted: exhausted_for.is_some(),
            exhausted_for_secs: exhausted_for.map(ceil_secs),
        }
    }
}

// ============================================================================
// Quota Manager
// ============================================================================

/// Per-provider / per-model usage tracking and admission
pub struct ProviderQuotaManager {
    limits: RwLock<HashMap<QuotaKey, QuotaLimits>>,
    usage: DashMap<QuotaKey, QuotaState>,
    metrics: Arc<dyn MetricsSink>,
}

impl ProviderQuotaManager {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            limits: RwLock::new(HashMap::new()),
            usage: DashMap::new(),
            metrics,
        }
    }

    /// Create with an initial set of limits
    pub fn with_limits<I>(limits: I, metrics: Arc<dyn MetricsSink>) -> Self
    where
        I: IntoIterator<Item = (QuotaKey, QuotaLimits)>,
    {
        let manager = Self::new(metrics);
        for (key, limits) in limits {
            manager.set_limits(key, limits);
        }
        manager
    }

    // ------------------------------------------------------------------------
    // Limit administration
    // ------------------------------------------------------------------------

    /// Configure (or replace) limits for a key
    pub fn set_limits(&self, key: QuotaKey, limits: QuotaLimits) {
        tracing::debug!(key = %key, ?limits, "Quota limits configured");
        self.usage
            .entry(key.clone())
            .or_insert_with(|| QuotaState::new(Instant::now()));
        self.limits.write().insert(key, limits);
    }

    /// Drop the limits for a key; usage counters are kept
    pub fn remove_limits(&self, key: &QuotaKey) -> Option<QuotaLimits> {
        self.limits.write().remove(key)
    }

    pub fn limits(&self, key: &QuotaKey) -> Option<QuotaLimits> {
        self.limits.read().get(key).cloned()
    }

    /// Key that owns the limits for this provider/model, plus those limits
    fn resolve(&self, provider: &str, model: Option<&str>) -> (QuotaKey, Option<QuotaLimits>) {
        let limits = self.limits.read();

        if let Some(model) = model {
            let key = QuotaKey::model(provider, model);
            if let Some(found) = limits.get(&key) {
                return (key, Some(found.clone()));
            }
        }

        let key = QuotaKey::provider(provider);
        let found = limits.get(&key).cloned();
        (key, found)
    }

    /// Denial from a model-level exhaustion mark when the limits live on the
    /// provider key
    ///
    /// Must be called without holding any other entry of `usage`.
    fn model_exhaustion(
        &self,
        provider: &str,
        model: Option<&str>,
        resolved: &QuotaKey,
        now: Instant,
    ) -> Option<(QuotaKey, QuotaCheck)> {
        let key = QuotaKey::model(provider, model?);
        if &key == resolved {
            return None;
        }

        let mut state = self.usage.get_mut(&key)?;
        let until = state.exhausted_until?;
        if now < until {
            return Some((
                key,
                QuotaCheck::denied("Quota exhausted".to_string(), until - now),
            ));
        }
        state.exhausted_until = None;
        None
    }

    // ------------------------------------------------------------------------
    // Admission and accounting
    // ------------------------------------------------------------------------

    /// Check whether one more request (with optional token estimate) fits
    pub fn check_quota(
        &self,
        provider: &str,
        model: Option<&str>,
        estimated_tokens: Option<u64>,
    ) -> QuotaCheck {
        let now = Instant::now();
        let (key, limits) = self.resolve(provider, model);

        if let Some((model_key, check)) = self.model_exhaustion(provider, model, &key, now) {
            self.report_denial(&model_key, &check);
            return check;
        }

        let check = {
            let mut state = self
                .usage
                .entry(key.clone())
                .or_insert_with(|| QuotaState::new(now));
            state.evaluate(now, limits.as_ref(), estimated_tokens)
        };

        if !check.allowed {
            self.report_denial(&key, &check);
        }
        check
    }

    /// Count one request (and its tokens) against every window
    pub fn record_usage(&self, provider: &str, model: Option<&str>, tokens: Option<u64>) {
        let now = Instant::now();
        let (key, _) = self.resolve(provider, model);

        {
            let mut state = self
                .usage
                .entry(key.clone())
                .or_insert_with(|| QuotaState::new(now));
            state.reset_stale(now);
            state.record(tokens);
        }

        let provider_label = key.provider.as_str();
        self.metrics
            .increment_counter("quota_requests_total", &[("provider", provider_label)], 1);
        if let Some(tokens) = tokens {
            self.metrics
                .increment_counter("quota_tokens_total", &[("provider", provider_label)], tokens);
        }
    }

    /// Check and, if allowed, record usage under a single key lock
    ///
    /// Concurrent callers can never jointly exceed a limit this way.
    pub fn check_and_record(
        &self,
        provider: &str,
        model: Option<&str>,
        tokens: Option<u64>,
    ) -> QuotaCheck {
        let now = Instant::now();
        let (key, limits) = self.resolve(provider, model);

        if let Some((model_key, check)) = self.model_exhaustion(provider, model, &key, now) {
            self.report_denial(&model_key, &check);
            return check;
        }

        let check = {
            let mut state = self
                .usage
                .entry(key.clone())
                .or_insert_with(|| QuotaState::new(now));
            let mut check = state.evaluate(now, limits.as_ref(), tokens);
            if check.allowed {
                state.record(tokens);
                if let Some(limits) = &limits {
                    check.remaining = state.remaining(limits);
                }
            }
            check
        };

        if check.allowed {
            let provider_label = key.provider.as_str();
            self.metrics
                .increment_counter("quota_requests_total", &[("provider", provider_label)], 1);
            if let Some(tokens) = tokens {
                self.metrics.increment_counter(
                    "quota_tokens_total",
                    &[("provider", provider_label)],
                    tokens,
                );
            }
        } else {
            self.report_denial(&key, &check);
        }
        check
    }

    fn report_denial(&self, key: &QuotaKey, check: &QuotaCheck) {
        tracing::debug!(
            key = %key,
            reason = check.reason.as_deref().unwrap_or_default(),
            retry_after_secs = check.retry_after_secs.unwrap_or_default(),
            "Quota check denied"
        );
        self.metrics.increment_counter(
            "quota_denied_total",
            &[("provider", key.provider.as_str())],
            1,
        );
    }

    /// Block the provider, or only one of its models, until `now + duration`
    /// (default one hour)
    ///
    /// Typically called when a provider reports its own quota as exhausted.
    /// A model mark never blocks sibling models of the same provider.
    pub fn mark_exhausted(&self, provider: &str, model: Option<&str>, duration: Option<Duration>) {
        let now = Instant::now();
        let duration = duration.unwrap_or(DEFAULT_EXHAUSTION);
        let key = match model {
            Some(model) => QuotaKey::model(provider, model),
            None => QuotaKey::provider(provider),
        };

        {
            let mut state = self
                .usage
                .entry(key.clone())
                .or_insert_with(|| QuotaState::new(now));
            state.exhausted_until = Some(now + duration);
        }

        tracing::warn!(
            key = %key,
            duration_secs = duration.as_secs(),
            "Quota marked exhausted"
        );
        self.metrics
            .increment_counter("quota_exhausted_total", &[("provider", key.provider.as_str())], 1);
    }

    // ------------------------------------------------------------------------
    // Admin / sweep
    // ------------------------------------------------------------------------

    /// Zero every window and clear exhaustion for a key
    ///
    /// Reset instants restart from now. Returns false for unknown keys.
    pub fn reset_quota(&self, key: &QuotaKey) -> bool {
        match self.usage.get_mut(key) {
            Some(mut state) => {
                *state = QuotaState::new(Instant::now());
                tracing::info!(key = %key, "Quota reset");
                true
            }
            None => false,
        }
    }

    pub fn get_quota_status(&self, key: &QuotaKey) -> Option<QuotaStatus> {
        let now = Instant::now();
        let limits = self.limits(key);
        self.usage
            .get(key)
            .map(|state| state.status(key, limits.as_ref(), now))
    }

    /// Status of every tracked key, sorted by key
    pub fn all_quota_status(&self) -> Vec<QuotaStatus> {
        let mut keys: Vec<QuotaKey> = self.usage.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys.iter()
            .filter_map(|key| self.get_quota_status(key))
            .collect()
    }

    /// Reset every window whose boundary has passed, across all keys
    ///
    /// Returns the number of keys that had at least one window reset.
    pub fn reset_stale_windows(&self) -> usize {
        let now = Instant::now();
        let mut reset = 0;

        for mut entry in self.usage.iter_mut() {
            let state = entry.value_mut();
            if state.exhausted_until.is_some_and(|until| now >= until) {
                state.exhausted_until = None;
            }
            if state.reset_stale(now) {
                reset += 1;
            }
        }

        if reset > 0 {
            tracing::debug!(keys = reset, "Quota sweep reset stale windows");
        }
        reset
    }

    /// Run [`reset_stale_windows`](Self::reset_stale_windows) every `interval`
    pub fn start_reset_sweep(self: &Arc<Self>, interval: Duration) -> BackgroundTask {
        let manager = Arc::clone(self);
        BackgroundTask::spawn_interval("quota-reset-sweep", interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.reset_stale_windows();
                Ok(())
            }
        })
    }
}

impl fmt::Debug for ProviderQuotaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderQuotaManager")
            .field("limits", &self.limits.read().len())
            .field("tracked_keys", &self.usage.len())
            .finish()
    }
}
