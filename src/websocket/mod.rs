//! WebSocket surface: the axum upgrade endpoint, adapters from
//! `axum::extract::ws` to the core's frame model, and the wire protocol.

pub mod handler;
pub mod message;
pub mod transport;

pub use handler::ws_handler;
pub use message::{ChannelEnvelope, ClientMessage, ServerMessage};
pub use transport::{WsFrameSink, WsFrameSource};
