//! Resilience Runtime
//!
//! Wires the resilience components together from a loaded configuration and
//! owns their background schedules for the lifetime of the daemon.
//!
//! ```text
//!                 ResilienceConfig
//!                        │
//!                        v
//!   InMemoryMetrics <── every component
//!                        │
//!   ┌────────────┬───────┴──────┬──────────────┬───────────┐
//!   Health     Quota        Fallback        Retry        Geo
//!   Monitor    Manager      Chain ─> Health
//!     │          │
//!   probe      reset
//!   task       sweep
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use resilience_core::{
    BackgroundTask, CircuitState, GeoRouter, HealthSummary, HttpHealthProbe, InMemoryMetrics,
    MetricsSink, ModelFallbackChain, ProviderHealthMetrics, ProviderHealthMonitor,
    ProviderQuotaManager, QuotaStatus, ResilienceConfig, SmartRetry, StaticModelRegistry,
};

/// Breaker state as reported in the periodic summary
#[derive(Clone, Debug, Serialize)]
pub struct CircuitSummary {
    pub model: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub retry_in_ms: Option<u64>,
}

/// Snapshot logged on every summary tick
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeSummary {
    pub health: HealthSummary,
    pub providers: Vec<ProviderHealthMetrics>,
    pub quotas: Vec<QuotaStatus>,
    pub circuits: Vec<CircuitSummary>,
    pub fallback_rules: usize,
    pub regions: usize,
}

/// All resilience components built from one configuration
pub struct ResilienceRuntime {
    pub config: ResilienceConfig,
    pub metrics: Arc<InMemoryMetrics>,
    pub health: Arc<ProviderHealthMonitor>,
    pub quota: Arc<ProviderQuotaManager>,
    pub registry: Arc<StaticModelRegistry>,
    pub fallback: Arc<ModelFallbackChain>,
    pub retry: Arc<SmartRetry>,
    pub geo: Arc<GeoRouter>,
}

impl ResilienceRuntime {
    /// Build every component from `config`
    pub fn from_config(config: ResilienceConfig) -> Result<Self> {
        let metrics = Arc::new(InMemoryMetrics::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let health = Arc::new(ProviderHealthMonitor::new(
            config.health.clone(),
            config.known_providers(),
            Arc::clone(&sink),
        ));

        let quota = Arc::new(ProviderQuotaManager::with_limits(
            config
                .quota
                .limits
                .iter()
                .map(|entry| (entry.key(), entry.limits.clone())),
            Arc::clone(&sink),
        ));

        let registry = Arc::new(StaticModelRegistry::with_models(config.models.clone()));

        let fallback = ModelFallbackChain::new(registry.clone(), Arc::clone(&sink))
            .with_health_monitor(Arc::clone(&health));
        for rule in &config.fallback_rules {
            fallback
                .add_rule(rule.clone())
                .with_context(|| format!("Failed to add fallback rule for {}", rule.primary_model))?;
        }

        let retry = Arc::new(SmartRetry::new(config.retry.clone(), Arc::clone(&sink)));
        let geo = Arc::new(GeoRouter::with_regions(config.geo.regions.clone(), sink));

        info!(
            providers = config.known_providers().len(),
            models = config.models.len(),
            fallback_rules = config.fallback_rules.len(),
            regions = config.geo.regions.len(),
            source = %config.source(),
            "Resilience runtime initialized"
        );

        Ok(Self {
            config,
            metrics,
            health,
            quota,
            registry,
            fallback: Arc::new(fallback),
            retry,
            geo,
        })
    }

    /// Start health probing (if enabled and any endpoint is configured) and
    /// the quota reset sweep
    pub fn start_background(&self, health_checks: bool) -> Vec<BackgroundTask> {
        let mut tasks = Vec::new();

        if health_checks && !self.config.health_endpoints.is_empty() {
            let probe = Arc::new(HttpHealthProbe::new(self.config.health_endpoints.clone()));
            tasks.push(self.health.start_health_checks(probe));
        } else {
            debug!("Health checks disabled or no endpoints configured");
        }

        tasks.push(self.quota.start_reset_sweep(self.config.quota.sweep_interval()));
        tasks
    }

    pub fn summary(&self) -> RuntimeSummary {
        let circuits = self
            .fallback
            .all_circuit_breaker_states()
            .into_iter()
            .map(|s| CircuitSummary {
                retry_in_ms: s.retry_in().map(|d| d.as_millis() as u64),
                model: s.model,
                state: s.state,
                failure_count: s.failure_count,
            })
            .collect();

        RuntimeSummary {
            health: self.health.get_health_summary(),
            providers: self.health.all_provider_metrics(),
            quotas: self.quota.all_quota_status(),
            circuits,
            fallback_rules: self.fallback.rules().len(),
            regions: self.geo.all_regions().len(),
        }
    }

    /// Log a summary every `interval` until `shutdown` fires
    pub async fn run(&self, shutdown: Arc<Notify>, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.notified() => break,
                _ = ticker.tick() => self.log_summary()?,
            }
        }
        Ok(())
    }

    fn log_summary(&self) -> Result<()> {
        let summary = self.summary();
        info!(
            providers = summary.health.total_providers,
            healthy = summary.health.healthy,
            degraded = summary.health.degraded,
            unhealthy = summary.health.unhealthy,
            offline = summary.health.offline,
            availability = summary.health.average_availability,
            "Health summary"
        );
        debug!(
            summary = %serde_json::to_string(&summary).context("Failed to serialize summary")?,
            "Resilience state"
        );
        debug!(metrics = %self.metrics.to_prometheus(), "Metrics snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::{load_config_from_path, ProviderError, ProviderStatus};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
providers = ["openai", "anthropic"]

[[quota.limits]]
provider = "openai"
requests_per_minute = 2

[[models]]
id = "gpt-4-turbo"
provider = "openai"

[[models]]
id = "claude-3-opus"
provider = "anthropic"

[[fallback_rules]]
primary_model = "gpt-4-turbo"
fallback_models = ["claude-3-opus"]
retry_delay_ms = 0

[[geo.regions]]
provider = "openai"
region = "us-east-1"
endpoint = "https://us.api.openai.example"
"#;

    fn runtime() -> ResilienceRuntime {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        ResilienceRuntime::from_config(config).unwrap()
    }

    #[test]
    fn test_components_seeded_from_config() {
        let runtime = runtime();

        assert_eq!(runtime.health.providers(), vec!["anthropic", "openai"]);
        assert!(runtime.quota.check_quota("openai", None, None).allowed);
        assert_eq!(runtime.fallback.rules().len(), 1);
        assert_eq!(runtime.geo.all_regions().len(), 1);
        assert!(runtime.registry.models().iter().any(|m| m.id == "claude-3-opus"));
    }

    #[test]
    fn test_invalid_rule_fails_startup() {
        let mut config = ResilienceConfig::default();
        config.fallback_rules = vec![resilience_core::FallbackRule::new("a", ["a"])];
        assert!(ResilienceRuntime::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_summary_reflects_traffic() {
        let runtime = runtime();
        runtime
            .health
            .record_request("openai", true, Duration::from_millis(120), None);

        let result = runtime
            .fallback
            .execute_fallback(
                "gpt-4-turbo",
                &ProviderError::http(429, "rate limit"),
                None,
                |target| async move { Ok::<_, ProviderError>(target.model) },
            )
            .await;
        assert!(result.success);

        let summary = runtime.summary();
        assert_eq!(summary.health.total_providers, 2);
        assert_eq!(summary.providers[1].status, ProviderStatus::Healthy);
        assert_eq!(summary.circuits.len(), 1);
        assert_eq!(summary.circuits[0].model, "gpt-4-turbo");
        assert_eq!(summary.fallback_rules, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["regions"], 1);
        assert!(runtime.metrics.to_prometheus().contains("provider_requests_total"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let runtime = Arc::new(runtime());
        let tasks = runtime.start_background(true);
        // No health endpoints configured, so only the quota sweep runs
        assert_eq!(tasks.len(), 1);

        let shutdown = Arc::new(Notify::new());
        let handle = {
            let runtime = Arc::clone(&runtime);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { runtime.run(shutdown, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.notify_one();
        assert!(handle.await.unwrap().is_ok());

        for task in tasks {
            task.stop().await;
        }
    }
}
