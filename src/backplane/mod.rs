//! Distributed publish/subscribe backplane boundary.
//!
//! The multiplexer holds exactly one backplane subscription per channel key
//! with local subscribers; the backplane guarantees at-least-once delivery
//! of a publish to every currently-active subscriber on that topic, across
//! process instances, with no cross-topic ordering.

mod backoff;
pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::config::BackplaneSettings;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use memory::{MemoryBackplane, MemoryBus};
pub use self::redis::RedisBackplane;

/// Receive callback for a topic subscription: `(topic, payload)`.
pub type TopicCallback = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error("backplane connection failed: {0}")]
    Connection(String),

    #[error("backplane command failed: {0}")]
    Command(String),

    #[error("backplane is shut down")]
    Closed,
}

/// Pub/sub transport connecting process instances.
///
/// `subscribe` is idempotent per topic (a second subscribe replaces the
/// callback), and `unsubscribe` on an unknown topic is a no-op; the
/// multiplexer's reconcile step relies on both.
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<(), BackplaneError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BackplaneError>;
}

/// Creates the backplane selected by configuration.
pub async fn create_backplane(
    settings: &BackplaneSettings,
) -> Result<Arc<dyn Backplane>, BackplaneError> {
    match settings.backend.as_str() {
        "redis" => {
            tracing::info!(url = %settings.redis_url, "creating Redis backplane");
            let backplane = RedisBackplane::connect(&settings.redis_url).await?;
            Ok(Arc::new(backplane))
        }
        "memory" => {
            tracing::info!("creating in-memory backplane (single-instance deployment)");
            Ok(Arc::new(MemoryBackplane::connect(Arc::new(MemoryBus::new()))))
        }
        other => Err(BackplaneError::Connection(format!(
            "unknown backplane backend: {other}"
        ))),
    }
}
