//! Owned Background Tasks
//!
//! Periodic work (health probing, quota window sweeps) runs on a fixed
//! interval inside a tokio task owned by a [`BackgroundTask`] handle.
//!
//! ```text
//! start_*() ──> BackgroundTask ──spawn──> loop {
//!                    │                       select! {
//!                    │ stop().await            shutdown.notified() => break,
//!                    └──────── Notify ────>    interval.tick() => tick().await,
//!                                            }
//!                                          }
//! ```
//!
//! `stop()` signals shutdown and waits for the loop to exit, so no tick is
//! running once it returns. Dropping the handle without stopping aborts the
//! task. A tick that returns an error is logged and the loop keeps going.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle to a periodic background task
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`, first run one period from now
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_interval<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let shutdown = Arc::new(Notify::new());
        let period = period.max(Duration::from_millis(1));

        let task_name = name.clone();
        let task_shutdown = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(task = %task_name, period_ms = period.as_millis() as u64, "Background task started");

            loop {
                tokio::select! {
                    _ = task_shutdown.notified() => break,
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            tracing::warn!(task = %task_name, error = %e, "Background task iteration failed");
                        }
                    }
                }
            }

            tracing::debug!(task = %task_name, "Background task stopped");
        });

        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = %self.name, error = %e, "Background task panicked");
                }
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
