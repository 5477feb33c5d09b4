//! Graceful Shutdown Handling
//!
//! Listens for SIGTERM/SIGINT, broadcasts the shutdown signal to every
//! interested task, and waits for the fleet's referenced connections to
//! drain before the process exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::fleet::Fleet;
use crate::Result;

/// Shutdown coordinator that manages the graceful shutdown process.
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_complete: Arc<Notify>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            shutdown_complete: Arc::new(Notify::new()),
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Get a handle to wait for shutdown completion.
    pub fn completion_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_complete)
    }

    /// Trigger shutdown programmatically, without a signal.
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Block until SIGTERM or SIGINT arrives, then broadcast shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }
        Ok(())
    }

    /// Wait for the fleet's referenced connections to drain, then tear the
    /// fleet down. Unreferenced connections do not block shutdown.
    pub async fn drain_fleet(&self, fleet: Fleet) {
        let start = Instant::now();
        let mut last_count = referenced(&fleet).await;
        info!(
            active = last_count,
            timeout = ?self.timeout,
            "waiting for referenced connections to drain"
        );

        while last_count > 0 && start.elapsed() < self.timeout {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let current = referenced(&fleet).await;
            if current != last_count {
                debug!(from = last_count, to = current, "connections draining");
                last_count = current;
            }
        }

        if last_count == 0 {
            info!(elapsed = ?start.elapsed(), "all referenced connections drained");
        } else {
            warn!(
                elapsed = ?start.elapsed(),
                remaining = last_count,
                "drain timeout reached with connections still referenced"
            );
        }

        fleet.shutdown().await;
        self.shutdown_complete.notify_waiters();
    }

    /// Wait for shutdown completion with timeout.
    pub async fn wait_for_completion(&self) -> Result<()> {
        tokio::time::timeout(
            self.timeout + Duration::from_secs(5),
            self.shutdown_complete.notified(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Shutdown completion timeout"))?;
        Ok(())
    }
}

async fn referenced(fleet: &Fleet) -> usize {
    fleet
        .list_connections()
        .await
        .iter()
        .filter(|snap| snap.refcount > 0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn completion_handle_is_notified() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let complete = coordinator.completion_handle();

        let waiter = tokio::spawn(async move { complete.notified().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.shutdown_complete.notify_waiters();

        waiter.await.unwrap();
    }
}
