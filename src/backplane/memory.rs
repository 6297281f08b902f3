//! In-memory backplane for single-instance deployments and tests.
//!
//! [`MemoryBus`] plays the broker: an explicitly owned, lifetime-scoped
//! value constructed at startup, never shared through a global. Each
//! [`MemoryBackplane`] is one client attached to the bus, so tests can
//! model several process instances by attaching several backplanes to the
//! same bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Backplane, BackplaneError, TopicCallback};

/// The broker: topic → per-client callbacks.
pub struct MemoryBus {
    topics: DashMap<String, HashMap<u64, TopicCallback>>,
    next_client: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_client: AtomicU64::new(1),
        }
    }

    fn allocate_client(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, client: u64, topic: &str, callback: TopicCallback) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(client, callback);
    }

    fn unregister(&self, client: u64, topic: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.remove(&client);
            if entry.is_empty() {
                drop(entry);
                self.topics.remove_if(topic, |_, callbacks| callbacks.is_empty());
            }
        }
    }

    /// Number of clients currently subscribed to `topic`. Used by stats
    /// endpoints and tests asserting the one-subscription-per-key invariant.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriber_count(topic) > 0
    }

    fn dispatch(&self, topic: &str, payload: &str) {
        let callbacks: Vec<TopicCallback> = self
            .topics
            .get(topic)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();

        // Delivery is always asynchronous, so a publish on the subscribing
        // instance round-trips the same way it would through a real broker.
        for callback in callbacks {
            let topic = topic.to_string();
            let payload = payload.to_string();
            tokio::spawn(async move {
                callback(topic, payload).await;
            });
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One client attached to a [`MemoryBus`].
pub struct MemoryBackplane {
    bus: Arc<MemoryBus>,
    client_id: u64,
}

impl MemoryBackplane {
    pub fn connect(bus: Arc<MemoryBus>) -> Self {
        let client_id = bus.allocate_client();
        Self { bus, client_id }
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<(), BackplaneError> {
        self.bus.register(self.client_id, topic, callback);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError> {
        self.bus.unregister(self.client_id, topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BackplaneError> {
        self.bus.dispatch(topic, payload);
        Ok(())
    }
}
