//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT (Ctrl+C on Windows), then drains the connection
//! manager within its shutdown budget.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, ShutdownReport};
use crate::Result;

/// Shutdown coordinator that manages the graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notification for shutdown completion
    shutdown_complete: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            shutdown_complete: Arc::new(Notify::new()),
        }
    }

    /// Receiver for components that stop on shutdown
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn completion_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_complete)
    }

    /// Broadcast shutdown without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no listeners");
        }
    }

    /// Block until SIGTERM or SIGINT, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, closing all connections");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, closing all connections");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, closing all connections");
        }

        self.trigger();
        Ok(())
    }

    /// Stop every mapping, bounded by the manager's shutdown budget
    pub async fn shutdown_connection_manager(&self, manager: &ConnectionManager) -> ShutdownReport {
        info!(
            "Closing {} connections (timeout: {:?})",
            manager.list().await.len(),
            manager.config().shutdown.timeout
        );

        let report = manager.shutdown_all().await;

        if report.is_clean() {
            info!("All connections closed gracefully in {:?}", report.elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?}, forced termination of {:?}",
                report.elapsed, report.abandoned
            );
        }

        self.shutdown_complete.notify_waiters();
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerSettings};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();
        tokio_test::assert_ok!(receiver.recv().await);
    }

    #[tokio::test]
    async fn test_drain_empty_manager_notifies_completion() {
        let coordinator = ShutdownCoordinator::new();
        let manager = ConnectionManager::new(Arc::new(Config::default()), ServerSettings::default());

        let completion = coordinator.completion_handle();
        let waiter = tokio::spawn(async move { completion.notified().await });
        // Let the waiter register before notify_waiters fires
        sleep(Duration::from_millis(50)).await;

        let report = coordinator.shutdown_connection_manager(&manager).await;
        assert!(report.is_clean());
        assert!(report.stopped.is_empty());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.is_shutting_down());
    }
}
