use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;

use crate::connection::FrameSink;
use crate::metrics::{
    CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL, CONNECTION_DURATION_SECONDS,
};
use crate::server::AppState;

use super::transport::{WsFrameSink, WsFrameSource};

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state), fields(otel.kind = "server"))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_start = std::time::Instant::now();

    let (sender, receiver) = socket.split();
    let sink: Arc<dyn FrameSink> = Arc::new(WsFrameSink::new(sender));
    let connection = (state.connection_factory)(sink);

    CONNECTIONS_OPENED_TOTAL.inc();
    tracing::info!("WebSocket connection established");

    state
        .driver
        .run_session(connection, WsFrameSource::new(receiver))
        .await;

    CONNECTIONS_CLOSED_TOTAL.inc();
    let duration = connection_start.elapsed().as_secs_f64();
    CONNECTION_DURATION_SECONDS.observe(duration);

    tracing::info!(duration_secs = duration, "WebSocket connection closed");
}
