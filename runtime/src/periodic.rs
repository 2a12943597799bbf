//! Periodic task runner.
//!
//! A [`PeriodicRunner`] owns nothing global: the process composes it at startup,
//! hands it a task and keeps the returned [`PeriodicHandle`] for shutdown. Tests
//! skip the runner entirely and call [`PeriodicTask::tick`] directly.
//!
//! # Example
//!
//! ```ignore
//! let handle = PeriodicRunner::new(Duration::from_secs(60)).spawn(dispatcher);
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown(Duration::from_secs(30)).await?;
//! ```

use crate::error::RunnerError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A unit of work executed on every tick.
///
/// Uses an explicit boxed future so runners can hold `Arc<dyn PeriodicTask>`.
pub trait PeriodicTask: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Run one iteration.
    ///
    /// An error is logged by the runner; the loop keeps going.
    fn tick(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// Drives a [`PeriodicTask`] on a fixed cadence.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicRunner {
    interval: Duration,
}

impl PeriodicRunner {
    /// Create a runner that ticks every `interval`
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn the task loop on the current tokio runtime.
    ///
    /// The first tick fires immediately. Ticks that would overlap a slow
    /// iteration are skipped rather than queued.
    #[must_use]
    pub fn spawn(self, task: Arc<dyn PeriodicTask>) -> PeriodicHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = task.name().to_string();
        let interval = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                task = task.name(),
                interval_ms = interval.as_millis(),
                "Periodic task started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let task_name = task.name().to_string();
                        metrics::counter!("careslot_periodic_ticks_total", "task" => task_name)
                            .increment(1);
                        if let Err(error) = task.tick().await {
                            tracing::warn!(
                                task = task.name(),
                                error = %error,
                                "Periodic task iteration failed"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(task = task.name(), "Periodic task stopped");
        });

        PeriodicHandle {
            name,
            shutdown_tx,
            join,
        }
    }
}

/// Handle to a spawned periodic task
#[derive(Debug)]
pub struct PeriodicHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Signal the loop to stop and wait for the in-flight iteration to finish.
    ///
    /// # Errors
    ///
    /// - [`RunnerError::ShutdownTimeout`] if the loop does not stop within `timeout`
    /// - [`RunnerError::TaskJoinError`] if the loop panicked
    pub async fn shutdown(self, timeout: Duration) -> Result<(), RunnerError> {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(timeout, self.join).await {
            Ok(result) => result.map_err(RunnerError::from),
            Err(_) => Err(RunnerError::ShutdownTimeout(self.name)),
        }
    }
}
