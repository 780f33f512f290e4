//! Graceful shutdown coordinator for logvault
//!
//! This module provides the cancellation signal shared by the batch processor, its
//! supervisor, and the CLI. It handles OS signal processing and lets every waiting
//! task return immediately once shutdown starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Shutdown coordinator that manages graceful shutdown of all services
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    /// Atomic flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Create a listener for a background task
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            shutdown_rx: self.shutdown_tx.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::AcqRel) {
            info!("Initiating graceful shutdown...");
            // No receivers just means no task is waiting right now; the flag covers late listeners
            if self.shutdown_tx.send(()).is_err() {
                warn!("Shutdown signalled with no active listeners");
            }
        }
    }

    /// Wait for shutdown signals (SIGTERM, SIGINT, or manual trigger)
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut manual = self.listener();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
            _ = manual.cancelled() => {}
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task view of the shutdown signal
#[derive(Debug)]
pub struct ShutdownListener {
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ShutdownListener {
    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been requested
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other waits.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_shutdown() {
                return;
            }
            match self.shutdown_rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Wait for either a shutdown signal or the specified duration
    ///
    /// Returns `true` if shutdown was requested.
    pub async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        self.wait_until_or_shutdown(Instant::now() + duration).await
    }

    /// Wait for either a shutdown signal or the deadline
    pub async fn wait_until_or_shutdown(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep_until(deadline) => false,
        }
    }
}

impl Clone for ShutdownListener {
    fn clone(&self) -> Self {
        Self {
            shutdown_rx: self.shutdown_rx.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}
