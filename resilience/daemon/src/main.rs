//! Resilience Daemon - Host Process for the Gateway Resilience Layer
//!
//! Loads the resilience configuration, builds the health monitor, quota
//! manager, fallback chain, retry executor and geo router, runs their
//! background schedules and periodically logs a state summary.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/ai-gateway/resilience.toml if present)
//! resilience-daemon
//!
//! # With config file
//! resilience-daemon --config /etc/ai-gateway/resilience.toml
//!
//! # Summaries every 10 seconds, no synthetic probes
//! resilience-daemon --summary-interval-secs 10 --no-health-checks
//!
//! # Verbose logging
//! RUST_LOG=debug resilience-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (background tasks are stopped)

mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use resilience_core::{load_config, load_config_from_path, ConfigOverrides};
use runtime::ResilienceRuntime;

/// Resilience Daemon - health, quota, fallback, retry and geo routing for the AI gateway
#[derive(Parser, Debug)]
#[command(name = "resilience-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RESILIENCE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between state summaries
    #[arg(long, env = "RESILIENCE_SUMMARY_INTERVAL_SECS", default_value_t = 60)]
    summary_interval_secs: u64,

    /// Disable synthetic health probes
    #[arg(long)]
    no_health_checks: bool,

    /// Override the health probe interval (milliseconds)
    #[arg(long, value_name = "MS")]
    health_check_interval_ms: Option<u64>,

    /// Override the retry budget
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Require this data residency tag for geo routing
    #[arg(long, value_name = "TAG")]
    data_residency_region: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RESILIENCE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ms) = self.health_check_interval_ms {
            overrides = overrides.with_health_check_interval_ms(ms);
        }
        if let Some(retries) = self.max_retries {
            overrides = overrides.with_max_retries(retries);
        }
        if let Some(ref region) = self.data_residency_region {
            overrides = overrides.with_data_residency_region(region.clone());
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "resilience_daemon={level},resilience_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Resolve when SIGTERM or SIGINT arrives
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Resilience Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config {
        Some(ref path) => {
            info!(config_path = ?path, "Config file");
            load_config_from_path(Some(path.clone()))
        }
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    args.overrides().apply(&mut config);
    config
        .validate()
        .context("Invalid configuration after CLI overrides")?;

    let runtime = ResilienceRuntime::from_config(config)?;
    let tasks = runtime.start_background(!args.no_health_checks);
    info!(tasks = tasks.len(), "Background tasks started");

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        signal_shutdown.notify_one();
    });

    let result = runtime
        .run(shutdown, Duration::from_secs(args.summary_interval_secs))
        .await;

    info!("Shutting down...");
    for task in tasks {
        let name = task.name().to_string();
        task.stop().await;
        info!(task = %name, "Background task stopped");
    }

    match result {
        Ok(()) => {
            info!("Resilience daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
