//! Graceful shutdown handling for the relay service.
//!
//! Coordinated shutdown:
//! 1. Notifies all connected clients about the impending shutdown
//! 2. Signals background tasks to stop
//! 3. Waits for connections to close

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection::{Frame, RelayConnection, SocketConnection};
use crate::registry::ConnectionRegistry;
use crate::websocket::ServerMessage;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Time to wait for connections to close (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Suggested reconnect delay to send to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

/// Handles graceful shutdown of the relay service
pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry<RelayConnection>>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        registry: Arc<ConnectionRegistry<RelayConnection>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry<RelayConnection>>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Notify all connected clients about shutdown
    async fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.registry.all();
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        let message =
            ServerMessage::shutdown(reason, Some(self.config.reconnect_after_seconds));
        let text = match serde_json::to_string(&message) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize shutdown notice");
                return 0;
            }
        };

        let mut futures = FuturesUnordered::new();
        let mut notified = 0;

        for conn in connections {
            let text = text.clone();
            futures.push(async move {
                if !conn.sink().is_open() {
                    return false;
                }
                matches!(
                    timeout(Duration::from_secs(2), conn.sink().send(Frame::Text(text))).await,
                    Ok(Ok(()))
                )
            });
        }

        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };

        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Shutdown notifications sent");
        notified
    }

    /// Wait for connections to close gracefully
    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.registry.len();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if self.registry.is_empty() {
                    break;
                }
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let remaining = self.registry.len();
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        initial - remaining
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether shutdown completed successfully
    pub success: bool,
    /// Number of clients that were notified
    pub clients_notified: usize,
    /// Number of connections that closed gracefully
    pub connections_closed: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_no_connections() {
        tokio_test::block_on(async {
            let registry = Arc::new(ConnectionRegistry::new());
            let (tx, _) = broadcast::channel(1);
            let shutdown = GracefulShutdown::new(registry, tx);

            let result = shutdown.execute("test shutdown").await;

            assert!(result.success);
            assert_eq!(result.clients_notified, 0);
            assert_eq!(result.connections_closed, 0);
        });
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.client_notification_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_after_seconds, 5);
    }
}
