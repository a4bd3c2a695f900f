//! Graceful shutdown coordinator for keengate
//!
//! Background tasks subscribe to the coordinator and stop when the process
//! receives SIGINT or SIGTERM. The server waits for them, bounded by a
//! timeout, before exiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown coordinator that manages graceful shutdown of all services
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    /// Atomic flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<()>,
    /// Background tasks to wait for on shutdown
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a shutdown receiver for background tasks
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Register a background task to be awaited on shutdown
    pub async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::Relaxed) {
            info!("Initiating graceful shutdown...");
            if let Err(e) = self.shutdown_tx.send(()) {
                // no subscribers left, nothing to notify
                warn!("Failed to send shutdown signal: {}", e);
            }
        }
    }

    /// Wait for SIGINT, SIGTERM or a manual trigger
    pub async fn wait_for_shutdown_signal(&self) {
        let mut manual = self.subscribe();

        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
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
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
            _ = manual.recv() => {
                info!("Shutdown requested");
            }
        }

        self.initiate_shutdown();
    }

    /// Wait for tracked background tasks, giving up after `timeout`
    pub async fn wait_for_tasks_completion(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }

        info!(
            "Waiting up to {} seconds for {} background task(s) to complete...",
            timeout.as_secs(),
            handles.len()
        );

        let all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        };

        match tokio::time::timeout(timeout, all).await {
            Ok(()) => info!("Background tasks completed shutdown"),
            Err(_) => warn!("Shutdown timeout reached, some tasks may not have completed gracefully"),
        }
    }
}

/// Background task wrapper that handles shutdown signals
pub struct ShutdownAwareTask {
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn new(coordinator: &ShutdownCoordinator) -> Self {
        Self {
            shutdown_rx: coordinator.subscribe(),
        }
    }

    /// Wait for either a shutdown signal or the specified duration
    ///
    /// Returns `true` when shutdown was requested.
    pub async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
