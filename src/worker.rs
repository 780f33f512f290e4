//! # Worker Supervision Module
//!
//! Long-running background tasks implement [`Worker`] and are handed to [`supervise`],
//! which runs them on their own tokio task and restarts them with backoff if they return
//! an error or panic. A worker that returns `Ok(())` after shutdown has been requested
//! ends supervision.
//!
//! The restart policy is an explicit [`Backoff`] parameter, so every supervised task
//! states its own retry behavior.

use crate::error::PipelineError;
use crate::shutdown::ShutdownCoordinator;
use crate::shutdown::ShutdownListener;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A restartable background task
pub trait Worker: Send + Sync + 'static {
    /// Name used in supervision logs
    fn name(&self) -> &str;

    /// Run until shutdown is requested or an unrecoverable error occurs
    fn run(
        &self,
        shutdown: ShutdownListener,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// Exponential restart delay between `initial` and `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay to use after `current`
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Run `worker` until shutdown, restarting it after errors and panics
///
/// Returns the number of restarts performed.
pub async fn supervise<W: Worker>(
    worker: Arc<W>,
    coordinator: ShutdownCoordinator,
    backoff: Backoff,
) -> u32 {
    let name = worker.name().to_string();
    let mut listener = coordinator.listener();
    let mut delay = backoff.initial;
    let mut restarts = 0;

    loop {
        let started = Instant::now();
        let task_worker = worker.clone();
        let task_listener = coordinator.listener();
        let outcome = tokio::spawn(async move { task_worker.run(task_listener).await }).await;

        match outcome {
            Ok(Ok(())) if coordinator.is_shutdown_initiated() => {
                info!("Worker '{}' stopped", name);
                return restarts;
            }
            Ok(Ok(())) => {
                warn!("Worker '{}' exited without a shutdown request", name);
            }
            Ok(Err(e)) => {
                error!(worker = %name, error = %e, "Worker failed");
            }
            Err(join_error) if join_error.is_panic() => {
                error!(
                    worker = %name,
                    error = %PipelineError::WorkerPanicked(name.clone()),
                    "Worker panicked"
                );
            }
            Err(join_error) => {
                warn!("Worker '{}' was cancelled: {}", name, join_error);
                return restarts;
            }
        }

        if coordinator.is_shutdown_initiated() {
            return restarts;
        }

        // A run that outlived the longest backoff starts the schedule over
        if started.elapsed() > backoff.max {
            delay = backoff.initial;
        }

        info!("Restarting worker '{}' in {:?}", name, delay);
        if listener.wait_or_shutdown(delay).await {
            return restarts;
        }
        restarts += 1;
        delay = backoff.next(delay);
    }
}
