//! Prometheus metrics for the relay service.
//!
//! Covers the connection lifecycle, channel subscriptions, message fanout,
//! and backplane health.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "lattice";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Number of live registered connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of live registered connections"
    ).unwrap();

    /// Total connections accepted since startup
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    /// Total connections closed since startup
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connection lifetime distribution
    pub static ref CONNECTION_DURATION_SECONDS: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Channel Metrics
    // ============================================================================

    /// Channels with at least one local subscriber
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Number of channels with at least one local subscriber"
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages published to the backplane
    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_published_total", METRIC_PREFIX),
        "Total messages published to the backplane"
    ).unwrap();

    /// Messages delivered to local subscribers
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages delivered to local subscribers"
    ).unwrap();

    // ============================================================================
    // Backplane Metrics
    // ============================================================================

    /// Backplane reconnection attempts
    pub static ref BACKPLANE_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_backplane_reconnects_total", METRIC_PREFIX),
        "Total backplane reconnections"
    ).unwrap();
}

/// Encodes the default registry in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        CONNECTIONS_OPENED_TOTAL.inc();
        MESSAGES_PUBLISHED_TOTAL.inc();

        let encoded = encode_metrics().expect("encoding should succeed");
        assert!(encoded.contains("lattice_connections_opened_total"));
        assert!(encoded.contains("lattice_messages_published_total"));
    }
}
