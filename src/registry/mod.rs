//! Connection registry: the set of live connections for this process
//! instance, keyed by registry-assigned id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{ConnectionId, SocketConnection};
use crate::metrics::CONNECTIONS_ACTIVE;

/// Thread-safe id → connection map.
///
/// All mutation goes through dashmap's sharded locking; there is no global
/// lock serializing unrelated connections.
pub struct ConnectionRegistry<C> {
    connections: DashMap<ConnectionId, Arc<C>>,
}

impl<C: SocketConnection> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Stores the connection under a freshly generated id and returns it.
    pub fn register(&self, connection: Arc<C>) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.insert(id, connection);
        CONNECTIONS_ACTIVE.set(self.connections.len() as i64);

        tracing::debug!(connection_id = %id, "connection registered");
        id
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<C>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Reverse lookup by connection identity (pointer identity, not value
    /// equality on mutable fields).
    pub fn resolve_id(&self, connection: &Arc<C>) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|entry| Arc::ptr_eq(entry.value(), connection))
            .map(|entry| *entry.key())
    }

    /// Removes the mapping if present and gracefully closes the transport.
    ///
    /// Concurrent double-removal is safe: the second caller finds nothing
    /// and no-ops. A close error here means the peer already tore the
    /// connection down, which is expected, not exceptional.
    pub async fn remove(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            CONNECTIONS_ACTIVE.set(self.connections.len() as i64);

            if let Err(e) = connection.sink().close("closed by the connection registry").await {
                tracing::debug!(
                    connection_id = %id,
                    error = %e,
                    "close on an already-terminated connection"
                );
            }
            tracing::debug!(connection_id = %id, "connection removed");
        }
    }

    /// Snapshot of all live connections, safe to iterate while other tasks
    /// register and remove concurrently.
    pub fn all(&self) -> Vec<Arc<C>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of (id, connection) pairs, for inspection endpoints.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<C>)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<C: SocketConnection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Frame, FrameSink, RelayConnection, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        closes: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSink for CountingSink {
        fn is_open(&self) -> bool {
            self.closes.load(Ordering::SeqCst) == 0
        }

        async fn send(&self, _frame: Frame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, _reason: &str) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection() -> Arc<RelayConnection> {
        Arc::new(RelayConnection::new(Arc::new(CountingSink::new())))
    }

    #[tokio::test]
    async fn register_then_resolve_returns_same_id() {
        let registry = ConnectionRegistry::new();
        let conn = connection();

        let id = registry.register(conn.clone());
        assert_eq!(registry.resolve_id(&conn), Some(id));
    }

    #[tokio::test]
    async fn lookup_by_id_returns_the_registered_connection() {
        let registry = ConnectionRegistry::new();
        let conn = connection();
        let id = registry.register(conn.clone());

        let found = registry.get(&id).expect("connection should be present");
        assert!(Arc::ptr_eq(&found, &conn));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = connection();
        let id = registry.register(conn);

        registry.remove(&id).await;
        registry.remove(&id).await;

        assert!(registry.is_empty());
        assert_eq!(registry.get(&id).map(|_| ()), None);
    }

    #[tokio::test]
    async fn remove_closes_the_transport_exactly_once() {
        let registry = ConnectionRegistry::new();
        let sink = Arc::new(CountingSink::new());
        let conn = Arc::new(RelayConnection::new(sink.clone() as Arc<dyn FrameSink>));
        let id = registry.register(conn);

        registry.remove(&id).await;
        registry.remove(&id).await;

        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_connections_resolve_to_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        let b = connection();

        let id_a = registry.register(a.clone());
        let id_b = registry.register(b.clone());

        assert_ne!(id_a, id_b);
        assert_eq!(registry.resolve_id(&a), Some(id_a));
        assert_eq!(registry.resolve_id(&b), Some(id_b));
        assert_eq!(registry.len(), 2);
    }
}
