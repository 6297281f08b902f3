//! Connection entity and transport boundary.
//!
//! The core never performs a WebSocket handshake itself: it is handed an
//! already-open transport, split into a shared write half ([`FrameSink`])
//! and an exclusively owned read half ([`FrameSource`]). Everything above
//! this module is generic over [`SocketConnection`], so applications can
//! attach their own per-connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Registry-assigned connection identifier.
///
/// Generated from high-entropy randomness, never a counter, so ids are
/// unique for the lifetime of the process with negligible collision
/// probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single inbound or outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is no longer open. Expected during teardown races.
    #[error("transport closed")]
    Closed,

    #[error("transport failure: {0}")]
    Io(String),
}

/// Write half of a connection's transport.
///
/// Shared between the session driver, the registry (which closes it on
/// removal), and delivery callbacks. Implementations must tolerate sends
/// racing against a concurrent close: an error return is enough, callers
/// treat it as an expected termination, never as something to surface.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Whether the transport was open at the time of the call.
    fn is_open(&self) -> bool;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Graceful close with a normal-closure reason. Idempotent.
    async fn close(&self, reason: &str) -> Result<(), TransportError>;
}

/// Read half of a connection's transport.
///
/// `None` means the peer is gone; an `Err` item is a transport-level
/// failure the session treats as an implicit close.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Per-connection state the core needs access to.
///
/// Applications implement this on their own connection type; the provided
/// [`RelayConnection`] covers the common case.
pub trait SocketConnection: Send + Sync + 'static {
    /// The transport write half this connection exclusively owns.
    fn sink(&self) -> &Arc<dyn FrameSink>;

    /// Authorization flag: starts false, set by application logic after
    /// accept. The core only reads it.
    fn is_authorized(&self) -> bool;

    fn set_authorized(&self, authorized: bool);
}

/// Injected constructor: builds the application's connection type from a
/// freshly accepted transport.
pub type ConnectionFactory<C> = Arc<dyn Fn(Arc<dyn FrameSink>) -> Arc<C> + Send + Sync>;

/// The provided [`SocketConnection`] implementation used by the relay
/// service: transport handle, authorization flag, and the set of channel
/// keys the connection is currently subscribed to (so disconnect can leave
/// them all).
pub struct RelayConnection {
    sink: Arc<dyn FrameSink>,
    authorized: AtomicBool,
    subscriptions: RwLock<HashSet<String>>,
    pub connected_at: DateTime<Utc>,
}

impl RelayConnection {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            authorized: AtomicBool::new(false),
            subscriptions: RwLock::new(HashSet::new()),
            connected_at: Utc::now(),
        }
    }

    pub async fn track_subscription(&self, key: &str) {
        self.subscriptions.write().await.insert(key.to_string());
    }

    pub async fn untrack_subscription(&self, key: &str) {
        self.subscriptions.write().await.remove(key);
    }

    /// Snapshot of the channel keys this connection is subscribed to.
    pub async fn subscription_keys(&self) -> Vec<String> {
        self.subscriptions.read().await.iter().cloned().collect()
    }
}

impl SocketConnection for RelayConnection {
    fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }

    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::Release);
    }
}
