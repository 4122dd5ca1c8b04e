//! TOML Configuration File Support
//!
//! Loads the resilience layer's configuration from
//! `~/.config/ai-gateway/resilience.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller via [`ConfigOverrides`])
//! 2. Environment variables (`RESILIENCE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file lives at `$XDG_CONFIG_HOME/ai-gateway/resilience.toml`
//! (typically `~/.config/ai-gateway/resilience.toml`).
//!
//! # Example Configuration
//!
//! ```toml
//! providers = ["openai", "anthropic"]
//!
//! [health]
//! health_check_interval_ms = 30000
//! unhealthy_threshold = 3
//!
//! [health_endpoints]
//! openai = "https://status.openai.example/health"
//!
//! [retry]
//! max_retries = 2
//! retryable_reasons = ["rate_limit", "timeout", "server_error"]
//!
//! [quota]
//! sweep_interval_ms = 30000
//!
//! [[quota.limits]]
//! provider = "openai"
//! requests_per_minute = 500
//!
//! [[quota.limits]]
//! provider = "openai"
//! model = "gpt-4-turbo"
//! tokens_per_minute = 300000
//!
//! [[models]]
//! id = "gpt-4-turbo"
//! provider = "openai"
//! context_window = 128000
//!
//! [[fallback_rules]]
//! primary_model = "gpt-4-turbo"
//! fallback_models = ["claude-3-opus", "gpt-3.5-turbo"]
//! conditions = ["rate_limit", "unavailable"]
//!
//! [geo.routing]
//! preferred_regions = ["eu-west-1"]
//!
//! [[geo.regions]]
//! provider = "openai"
//! region = "eu-west-1"
//! endpoint = "https://eu.api.openai.example"
//! data_residency = ["eu"]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fallback::{FallbackRule, ModelInfo};
use crate::geo::{GeoRoutingConfig, ProviderRegion};
use crate::health::HealthConfig;
use crate::quota::{QuotaKey, QuotaLimits};
use crate::retry::RetryConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Sections
// =============================================================================

/// Limits for one provider or provider/model pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimitEntry {
    pub provider: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(flatten)]
    pub limits: QuotaLimits,
}

impl QuotaLimitEntry {
    pub fn key(&self) -> QuotaKey {
        QuotaKey {
            provider: self.provider.clone(),
            model: self.model.clone(),
        }
    }
}

/// `[quota]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    /// Period of the background window-reset sweep
    pub sweep_interval_ms: u64,

    pub limits: Vec<QuotaLimitEntry>,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            limits: Vec::new(),
        }
    }
}

impl QuotaSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// `[geo]` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSection {
    /// Routing constraints used when a request does not bring its own
    pub routing: GeoRoutingConfig,

    pub regions: Vec<ProviderRegion>,
}

// =============================================================================
// Resilience Configuration
// =============================================================================

/// Complete configuration for the resilience layer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Providers to track even before any traffic
    pub providers: Vec<String>,

    pub health: HealthConfig,

    /// Provider name to health-check URL
    pub health_endpoints: BTreeMap<String, String>,

    pub retry: RetryConfig,

    pub quota: QuotaSection,

    pub models: Vec<ModelInfo>,

    pub fallback_rules: Vec<FallbackRule>,

    pub geo: GeoSection,

    /// Where the configuration came from
    #[serde(skip)]
    pub source: ConfigSource,

    /// Path to the config file (if loaded from file)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

impl ResilienceConfig {
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Every provider named anywhere in the configuration, sorted
    pub fn known_providers(&self) -> Vec<String> {
        let mut providers: BTreeSet<String> = self.providers.iter().cloned().collect();
        providers.extend(self.health_endpoints.keys().cloned());
        providers.extend(self.quota.limits.iter().map(|l| l.provider.clone()));
        providers.extend(self.models.iter().map(|m| m.provider.clone()));
        providers.extend(self.geo.regions.iter().map(|r| r.provider.clone()));
        providers.into_iter().collect()
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(msg))
        };

        let health = &self.health;
        for (name, rate) in [
            ("health.degraded_error_rate", health.degraded_error_rate),
            ("health.unhealthy_error_rate", health.unhealthy_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return invalid(format!("{name} must be between 0 and 1, got {rate}"));
            }
        }
        if health.degraded_error_rate > health.unhealthy_error_rate {
            return invalid("health.degraded_error_rate exceeds health.unhealthy_error_rate".into());
        }
        if health.degraded_latency_ms > health.unhealthy_latency_ms {
            return invalid("health.degraded_latency_ms exceeds health.unhealthy_latency_ms".into());
        }
        if health.unhealthy_threshold == 0 {
            return invalid("health.unhealthy_threshold must be at least 1".into());
        }
        if health.metrics_window_ms == 0 || health.health_check_interval_ms == 0 {
            return invalid("health intervals and windows must be non-zero".into());
        }
        if !(health.sla_target > 0.0 && health.sla_target <= 1.0) {
            return invalid(format!("health.sla_target must be in (0, 1], got {}", health.sla_target));
        }

        let retry = &self.retry;
        if retry.backoff_multiplier < 1.0 {
            return invalid(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                retry.backoff_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return invalid(format!(
                "retry.jitter_factor must be between 0 and 1, got {}",
                retry.jitter_factor
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return invalid("retry.initial_delay_ms exceeds retry.max_delay_ms".into());
        }

        if self.quota.sweep_interval_ms == 0 {
            return invalid("quota.sweep_interval_ms must be non-zero".into());
        }
        let mut quota_keys = HashSet::new();
        for entry in &self.quota.limits {
            if !quota_keys.insert(entry.key()) {
                return invalid(format!("duplicate quota limits for {}", entry.key()));
            }
        }

        let mut primaries = HashSet::new();
        for rule in &self.fallback_rules {
            rule.validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            if !primaries.insert(rule.primary_model.as_str()) {
                return invalid(format!("duplicate fallback rule for {}", rule.primary_model));
            }
        }

        let routing = &self.geo.routing;
        if routing.data_residency_required && routing.data_residency_region.is_none() {
            return invalid(
                "geo.routing.data_residency_required needs geo.routing.data_residency_region".into(),
            );
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ai-gateway/resilience.toml` or
/// `~/.config/ai-gateway/resilience.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ai-gateway").join("resilience.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// resulting configuration is invalid. A missing file is not an error.
pub fn load_config() -> Result<ResilienceConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ResilienceConfig, ConfigError> {
    let mut config = match path {
        Some(ref config_path) if config_path.exists() => {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let mut config: ResilienceConfig = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
            config
        }
        Some(ref config_path) => {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
            ResilienceConfig::default()
        }
        None => ResilienceConfig::default(),
    };

    // Environment overrides file values
    apply_env_config(&mut config);

    config.validate()?;
    Ok(config)
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = %name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ResilienceConfig) {
    let before = config.clone();

    if let Some(ms) = env_value("RESILIENCE_HEALTH_CHECK_INTERVAL_MS") {
        config.health.health_check_interval_ms = ms;
    }
    if let Some(ms) = env_value("RESILIENCE_HEALTH_CHECK_TIMEOUT_MS") {
        config.health.health_check_timeout_ms = ms;
    }
    if let Some(ms) = env_value("RESILIENCE_METRICS_WINDOW_MS") {
        config.health.metrics_window_ms = ms;
    }
    if let Some(target) = env_value("RESILIENCE_SLA_TARGET") {
        config.health.sla_target = target;
    }

    if let Some(retries) = env_value("RESILIENCE_MAX_RETRIES") {
        config.retry.max_retries = retries;
    }
    if let Some(ms) = env_value("RESILIENCE_INITIAL_DELAY_MS") {
        config.retry.initial_delay_ms = ms;
    }
    if let Some(ms) = env_value("RESILIENCE_MAX_DELAY_MS") {
        config.retry.max_delay_ms = ms;
    }
    if let Some(enabled) = env_value("RESILIENCE_CROSS_PROVIDER_FAILOVER") {
        config.retry.enable_cross_provider_failover = enabled;
    }

    if let Some(ms) = env_value("RESILIENCE_QUOTA_SWEEP_INTERVAL_MS") {
        config.quota.sweep_interval_ms = ms;
    }

    if let Ok(region) = std::env::var("RESILIENCE_DATA_RESIDENCY_REGION") {
        config.geo.routing.data_residency_required = true;
        config.geo.routing.data_residency_region = Some(region);
    }

    if *config != before {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Overrides supplied on the command line, applied after loading
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Health probe interval override (milliseconds)
    pub health_check_interval_ms: Option<u64>,

    /// Retry budget override
    pub max_retries: Option<u32>,

    /// Required data residency tag
    pub data_residency_region: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_health_check_interval_ms(mut self, ms: u64) -> Self {
        self.health_check_interval_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_data_residency_region(mut self, region: impl Into<String>) -> Self {
        self.data_residency_region = Some(region.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ResilienceConfig) {
        if self.health_check_interval_ms.is_some()
            || self.max_retries.is_some()
            || self.data_residency_region.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ms) = self.health_check_interval_ms {
            config.health.health_check_interval_ms = ms;
        }

        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }

        if let Some(ref region) = self.data_residency_region {
            config.geo.routing.data_residency_required = true;
            config.geo.routing.data_residency_region = Some(region.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackCondition;
    use crate::types::FailureReason;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Serializes tests that touch process environment
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    const ENV_VARS: &[&str] = &[
        "RESILIENCE_HEALTH_CHECK_INTERVAL_MS",
        "RESILIENCE_HEALTH_CHECK_TIMEOUT_MS",
        "RESILIENCE_METRICS_WINDOW_MS",
        "RESILIENCE_SLA_TARGET",
        "RESILIENCE_MAX_RETRIES",
        "RESILIENCE_INITIAL_DELAY_MS",
        "RESILIENCE_MAX_DELAY_MS",
        "RESILIENCE_CROSS_PROVIDER_FAILOVER",
        "RESILIENCE_QUOTA_SWEEP_INTERVAL_MS",
        "RESILIENCE_DATA_RESIDENCY_REGION",
    ];

    fn clear_config_env_vars() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const FULL_CONFIG: &str = r#"
providers = ["local"]

[health]
health_check_interval_ms = 30000
unhealthy_threshold = 3

[health_endpoints]
openai = "https://status.openai.example/health"

[retry]
max_retries = 2
retryable_reasons = ["rate_limit", "timeout"]

[quota]
sweep_interval_ms = 15000

[[quota.limits]]
provider = "openai"
requests_per_minute = 500

[[quota.limits]]
provider = "openai"
model = "gpt-4-turbo"
tokens_per_minute = 300000

[[models]]
id = "gpt-4-turbo"
provider = "openai"
context_window = 128000

[[models]]
id = "claude-3-opus"
provider = "anthropic"
capabilities = ["vision"]

[[fallback_rules]]
primary_model = "gpt-4-turbo"
fallback_models = ["claude-3-opus"]
conditions = ["rate_limit", "unavailable"]
circuit_breaker_threshold = 2

[geo.routing]
preferred_regions = ["eu-west-1"]
max_latency_ms = 250

[[geo.regions]]
provider = "openai"
region = "eu-west-1"
endpoint = "https://eu.api.openai.example"
data_residency = ["eu"]

[[geo.regions]]
provider = "bedrock"
region = "us-east-1"
endpoint = "https://bedrock.us-east-1.example"
available = false
"#;

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ResilienceConfig::default();

        assert_eq!(config.health, HealthConfig::default());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.quota.sweep_interval(), Duration::from_secs(60));
        assert!(config.geo.routing.fallback_to_any_region);
        assert!(config.known_providers().is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("ai-gateway/resilience.toml"));
        }
    }

    // =========================================================================
    // File Parsing
    // =========================================================================

    #[test]
    fn test_parse_full_config() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let file = write_config(FULL_CONFIG);
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));

        assert_eq!(config.health.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.health.sla_target, 0.999);

        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(
            config.retry.retryable_reasons,
            [FailureReason::RateLimit, FailureReason::Timeout].into_iter().collect::<BTreeSet<_>>()
        );

        assert_eq!(config.quota.sweep_interval(), Duration::from_secs(15));
        assert_eq!(config.quota.limits.len(), 2);
        assert_eq!(config.quota.limits[0].key(), QuotaKey::provider("openai"));
        assert_eq!(config.quota.limits[0].limits.requests_per_minute, Some(500));
        assert_eq!(
            config.quota.limits[1].key(),
            QuotaKey::model("openai", "gpt-4-turbo")
        );
        assert_eq!(config.quota.limits[1].limits.tokens_per_minute, Some(300_000));

        assert_eq!(config.models.len(), 2);
        assert!(config.models[1].available);
        assert_eq!(config.models[0].context_window, Some(128_000));

        let rule = &config.fallback_rules[0];
        assert_eq!(rule.circuit_breaker_threshold, 2);
        assert_eq!(rule.max_retries, 3);
        assert!(rule.conditions.contains(&FallbackCondition::Unavailable));
        assert!(!rule.conditions.contains(&FallbackCondition::Error));

        assert_eq!(config.geo.routing.preferred_regions, vec!["eu-west-1"]);
        assert_eq!(config.geo.routing.max_latency_ms, Some(250));
        assert!(config.geo.routing.fallback_to_any_region);
        assert!(config.geo.regions[0].available);
        assert!(!config.geo.regions[1].available);
        assert!(config.geo.regions[0].data_residency.contains("eu"));

        assert_eq!(
            config.known_providers(),
            vec!["anthropic", "bedrock", "local", "openai"]
        );
    }

    #[test]
    fn test_parse_empty_toml() {
        let config: ResilienceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn test_missing_file_graceful() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let path = PathBuf::from("/nonexistent/path/resilience.toml");
        let config = load_config_from_path(Some(path)).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let _guard = ENV_LOCK.lock();
        let file = write_config("[retry\nmax_retries = \"many\"\n");

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let file = write_config(
            r#"
[[fallback_rules]]
primary_model = "a"
fallback_models = ["b", "a"]
"#,
        );
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_validation_rules() {
        let mut config = ResilienceConfig::default();
        config.health.degraded_error_rate = 0.5;
        config.health.unhealthy_error_rate = 0.2;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.retry.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.geo.routing.data_residency_required = true;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.fallback_rules = vec![
            FallbackRule::new("a", ["b"]),
            FallbackRule::new("a", ["c"]),
        ];
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        let entry = QuotaLimitEntry {
            provider: "openai".into(),
            model: None,
            limits: QuotaLimits::new().with_requests_per_minute(1),
        };
        config.quota.limits = vec![entry.clone(), entry];
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Priority Ordering
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        let file = write_config(FULL_CONFIG);
        std::env::set_var("RESILIENCE_MAX_RETRIES", "7");
        std::env::set_var("RESILIENCE_QUOTA_SWEEP_INTERVAL_MS", "5000");
        std::env::set_var("RESILIENCE_DATA_RESIDENCY_REGION", "eu");
        std::env::set_var("RESILIENCE_CROSS_PROVIDER_FAILOVER", "not-a-bool");

        let config = load_config_from_path(Some(file.path().to_path_buf()));
        clear_config_env_vars();
        let config = config.unwrap();

        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.quota.sweep_interval_ms, 5000);
        assert!(config.geo.routing.data_residency_required);
        assert_eq!(config.geo.routing.data_residency_region.as_deref(), Some("eu"));
        // Unparseable values are ignored
        assert!(config.retry.enable_cross_provider_failover);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let _guard = ENV_LOCK.lock();
        clear_config_env_vars();

        std::env::set_var("RESILIENCE_MAX_RETRIES", "7");
        let config = load_config_from_path(None);
        clear_config_env_vars();
        let mut config = config.unwrap();
        assert_eq!(config.retry.max_retries, 7);

        ConfigOverrides::new().with_max_retries(1).apply(&mut config);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_apply() {
        let mut config = ResilienceConfig::default();
        ConfigOverrides::new()
            .with_health_check_interval_ms(1000)
            .with_data_residency_region("eu")
            .apply(&mut config);

        assert_eq!(config.health.health_check_interval(), Duration::from_secs(1));
        assert!(config.geo.routing.data_residency_required);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = ResilienceConfig::default();
        let before = config.clone();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config, before);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }

    #[test]
    fn test_config_error_display() {
        let read_err = ConfigError::ReadError {
            path: PathBuf::from("/test/path"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(read_err.to_string().contains("/test/path"));

        let validation_err = ConfigError::ValidationError("invalid value".to_string());
        assert!(validation_err.to_string().contains("invalid value"));
    }
}
