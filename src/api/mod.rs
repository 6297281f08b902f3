//! HTTP inspection endpoints: health, stats, connection listing, metrics.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::{ConnectionId, SocketConnection};
use crate::error::AppError;
use crate::metrics::encode_metrics;
use crate::server::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        .route("/stats", get(stats))
        .route("/connections", get(connections))
        .route("/metrics", get(metrics))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct StatsResponse {
    connections: usize,
    channels: usize,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.registry.len(),
        channels: state.multiplexer.channel_count(),
    })
}

#[derive(Serialize)]
struct ConnectionInfo {
    id: ConnectionId,
    authorized: bool,
    connected_at: DateTime<Utc>,
    subscriptions: Vec<String>,
}

async fn connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    let mut list = Vec::new();
    for (id, connection) in state.registry.snapshot() {
        list.push(ConnectionInfo {
            id,
            authorized: connection.is_authorized(),
            connected_at: connection.connected_at,
            subscriptions: connection.subscription_keys().await,
        });
    }
    Json(list)
}

async fn metrics() -> Result<String, AppError> {
    encode_metrics().map_err(|e| AppError::Internal(e.to_string()))
}
