//! Resilience Core - Adaptive Routing and Failure Handling for an AI Gateway
//!
//! This crate sits between policy approval and the outbound provider call in
//! the gateway's request pipeline. It decides where a request may go and what
//! to do when a provider misbehaves. It never makes provider calls itself:
//! callers inject the execution operation.
//!
//! # Architecture
//!
//! ```text
//!                         request (policy approved)
//!                                   │
//!            ┌──────────────────────┼───────────────────────┐
//!            │                      v                       │
//!            │   ┌──────────────┐      ┌────────────────┐   │
//!            │   │  Geo Router  │      │ Quota Manager  │   │
//!            │   │ (region pick)│      │ (admission)    │   │
//!            │   └──────┬───────┘      └───────┬────────┘   │
//!            │          └──────────┬───────────┘            │
//!            │                     v                        │
//!            │            ┌─────────────────┐               │
//!            │            │   Smart Retry   │──────┐        │
//!            │            │ backoff+failover│      │        │
//!            │            └────────┬────────┘      │        │
//!            │                     │ exhausted     │ outcome│
//!            │                     v               v        │
//!            │            ┌─────────────────┐  ┌─────────┐  │
//!            │            │ Fallback Chain  │─>│ Health  │  │
//!            │            │ + breakers      │  │ Monitor │  │
//!            │            └─────────────────┘  └─────────┘  │
//!            └──────────────────────────────────────────────┘
//!                                   │
//!                         execute(provider, model)
//! ```
//!
//! # Module Overview
//!
//! - [`health`]: rolling per-provider availability, latency and status
//! - [`quota`]: per-minute/hour/day request and token budgets
//! - [`fallback`]: ordered model alternatives guarded by circuit breakers
//! - [`retry`]: exponential backoff with cross-provider failover
//! - [`geo`]: region selection by preference, residency and distance
//! - [`metrics`]: injected metrics sink and an in-memory implementation
//! - [`task`]: owned, cancellable periodic background tasks
//! - [`config`]: TOML/environment configuration loading
//! - [`types`]: provider addressing and failure classification
//!
//! All state is in memory. Every component takes its collaborators (metrics
//! sink, registry, health monitor) through its constructor; there are no
//! process-wide singletons.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod fallback;
pub mod geo;
pub mod health;
pub mod metrics;
pub mod quota;
pub mod retry;
pub mod task;
pub mod types;

// Re-exports for convenience
pub use types::{FailureReason, ProviderError, ProviderModel};

// Health exports
pub use health::{
    HealthConfig, HealthProbe, HealthSummary, HttpHealthProbe, ProbeError, ProviderHealthMetrics,
    ProviderHealthMonitor, ProviderStatus,
};

// Quota exports
pub use quota::{
    ProviderQuotaManager, QuotaCheck, QuotaKey, QuotaLimits, QuotaStatus, QuotaWindow,
    RemainingQuota, WindowStatus,
};

// Fallback exports
pub use fallback::{
    CircuitBreakerState, CircuitState, FallbackAttempt, FallbackCondition, FallbackError,
    FallbackResult, FallbackRule, ModelFallbackChain, ModelInfo, ModelRegistry, ModelRequirements,
    StaticModelRegistry,
};

// Retry exports
pub use retry::{RetryAttempt, RetryConfig, RetryError, RetryOptions, RetryResult, SmartRetry};

// Geo exports
pub use geo::{GeoRouteDecision, GeoRouter, GeoRoutingConfig, ProviderRegion, RouteStrategy};

// Metrics exports
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};

// Task exports
pub use task::BackgroundTask;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ResilienceConfig,
};
