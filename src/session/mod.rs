//! Per-connection session state machine.
//!
//! One task per connection drives `Connecting → Open → Closing → Closed`:
//! register in the registry, loop over inbound frames dispatching to the
//! handler, then tear down. Frames are processed strictly in arrival
//! order; a transport failure while reading is an implicit close, never an
//! error surfaced to anyone.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{ConnectionId, Frame, FrameSource, SocketConnection};
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Application-supplied callbacks invoked by the session driver.
#[async_trait]
pub trait SessionHandler<C: SocketConnection>: Send + Sync + 'static {
    /// The connection was accepted and registered under `id`.
    async fn on_connect(&self, connection: &Arc<C>, id: ConnectionId);

    /// The connection is going away; runs before registry removal.
    async fn on_disconnect(&self, connection: &Arc<C>);

    async fn on_text(&self, connection: &Arc<C>, text: String);

    async fn on_binary(&self, connection: &Arc<C>, data: Vec<u8>);
}

/// Drives sessions against a registry and a handler, and owns the outbound
/// send paths.
pub struct SessionDriver<C, H> {
    registry: Arc<ConnectionRegistry<C>>,
    handler: Arc<H>,
}

impl<C, H> SessionDriver<C, H>
where
    C: SocketConnection,
    H: SessionHandler<C>,
{
    pub fn new(registry: Arc<ConnectionRegistry<C>>, handler: Arc<H>) -> Self {
        Self { registry, handler }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C>> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Runs one connection's session to completion. Returns once the
    /// connection is closed and removed from the registry.
    pub async fn run_session<S: FrameSource>(&self, connection: Arc<C>, mut source: S) {
        // Connecting → Open: registration assigns the id.
        let id = self.registry.register(connection.clone());
        self.handler.on_connect(&connection, id).await;
        let mut state = SessionState::Open;
        tracing::debug!(connection_id = %id, "session open");

        while state == SessionState::Open {
            match source.next_frame().await {
                Some(Ok(Frame::Text(text))) => {
                    self.handler.on_text(&connection, text).await;
                }
                Some(Ok(Frame::Binary(data))) => {
                    self.handler.on_binary(&connection, data).await;
                }
                Some(Ok(Frame::Close)) => {
                    tracing::debug!(connection_id = %id, "received close frame");
                    state = SessionState::Closing;
                }
                Some(Err(e)) => {
                    // Abrupt disconnects and protocol violations are an
                    // implicit close, not an error.
                    tracing::debug!(connection_id = %id, error = %e, "transport failure, closing");
                    state = SessionState::Closing;
                }
                None => {
                    state = SessionState::Closing;
                }
            }
        }

        // Closing → Closed: removal also closes the transport.
        self.handler.on_disconnect(&connection).await;
        if let Some(resolved) = self.registry.resolve_id(&connection) {
            self.registry.remove(&resolved).await;
        }
        tracing::debug!(connection_id = %id, "session closed");
    }

    /// Sends a frame if the connection's transport is still open, and
    /// silently drops it otherwise. Never fails: a connection closing
    /// concurrently with the send is expected.
    pub async fn send(&self, connection: &C, frame: Frame) {
        let sink = connection.sink();
        if !sink.is_open() {
            return;
        }
        if let Err(e) = sink.send(frame).await {
            tracing::trace!(error = %e, "dropped frame for a closing connection");
        }
    }

    pub async fn send_by_id(&self, id: &ConnectionId, frame: Frame) {
        if let Some(connection) = self.registry.get(id) {
            self.send(&connection, frame).await;
        }
    }

    /// Broadcasts to every currently-open connection in the registry
    /// snapshot, each independently of the rest.
    pub async fn send_to_all(&self, frame: Frame) {
        for connection in self.registry.all() {
            if connection.sink().is_open() {
                self.send(&connection, frame.clone()).await;
            }
        }
    }
}
