//! Channel subscription multiplexer.
//!
//! Maps a channel key to the set of locally-subscribed connections and
//! keeps exactly one backplane subscription alive per key with local
//! subscribers, however many connections share it. Publishes never talk to
//! local subscribers directly: they round-trip through the backplane so
//! single-instance and multi-instance deployments behave identically.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::{smallvec, SmallVec};

use crate::backplane::{Backplane, BackplaneError, TopicCallback};
use crate::connection::SocketConnection;
use crate::metrics::{CHANNELS_ACTIVE, MESSAGES_DELIVERED_TOTAL, MESSAGES_PUBLISHED_TOTAL};

use super::topics::TopicScheme;

/// Delivery callback supplied on subscribe: `(payload, origin connection,
/// current local subscribers)`. The retained callback (and origin) is the
/// first creator's for each key; delivery always passes the subscriber set
/// as it exists when the message arrives.
pub type DeliveryFn<C> =
    Arc<dyn Fn(String, Arc<C>, Vec<Arc<C>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ChannelState<C> {
    origin: Arc<C>,
    subscribers: SmallVec<[Arc<C>; 4]>,
    on_message: DeliveryFn<C>,
}

pub struct ChannelMultiplexer<C> {
    channels: Arc<DashMap<String, ChannelState<C>>>,
    backplane: Arc<dyn Backplane>,
    topics: Arc<dyn TopicScheme>,
}

impl<C: SocketConnection> ChannelMultiplexer<C> {
    pub fn new(backplane: Arc<dyn Backplane>, topics: Arc<dyn TopicScheme>) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            backplane,
            topics,
        }
    }

    /// Subscribes `connection` to `key`.
    ///
    /// The first subscriber for a key creates the subscriber set (atomic
    /// insert-if-absent, so racing creators converge on one entry) and
    /// establishes the single backplane subscription for the derived topic.
    /// Later subscribers only join the existing set.
    pub async fn subscribe(
        &self,
        connection: Arc<C>,
        key: &str,
        on_message: DeliveryFn<C>,
    ) -> Result<(), BackplaneError> {
        let created = match self.channels.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().subscribers.push(connection.clone());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(ChannelState {
                    origin: connection.clone(),
                    subscribers: smallvec![connection.clone()],
                    on_message,
                });
                true
            }
        };

        if created {
            CHANNELS_ACTIVE.set(self.channels.len() as i64);
            if let Err(e) = self.sync_backplane(key).await {
                // Roll the membership back so a later subscribe starts clean.
                tracing::warn!(channel = %key, error = %e, "backplane subscription failed, rolling back");
                if let Err(rollback) = self.remove_member(&connection, key).await {
                    tracing::debug!(channel = %key, error = %rollback, "rollback teardown also failed");
                }
                return Err(e);
            }
            tracing::debug!(channel = %key, "channel created");
        }

        Ok(())
    }

    /// Removes `connection` from the key's subscriber set. The caller that
    /// observes the set draining tears the set and the backplane
    /// subscription down together.
    pub async fn unsubscribe(
        &self,
        connection: &Arc<C>,
        key: &str,
    ) -> Result<(), BackplaneError> {
        self.remove_member(connection, key).await
    }

    /// Unsubscribes from each key in turn; a failure on one key never
    /// blocks the rest.
    pub async fn unsubscribe_many(&self, connection: &Arc<C>, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.unsubscribe(connection, key).await {
                tracing::warn!(channel = %key, error = %e, "unsubscribe failed, continuing");
            }
        }
    }

    /// Publishes `payload` on the backplane topic for `key`. Local
    /// delivery happens asynchronously through this instance's own
    /// subscription callback, like on every other instance.
    pub async fn publish(&self, key: &str, payload: &str) -> Result<(), BackplaneError> {
        let topic = self.topics.full_key(key);
        self.backplane.publish(&topic, payload).await?;
        MESSAGES_PUBLISHED_TOTAL.inc();
        Ok(())
    }

    pub async fn publish_many(&self, keys: &[String], payload: &str) -> Result<(), BackplaneError> {
        for key in keys {
            self.publish(key, payload).await?;
        }
        Ok(())
    }

    /// Current local subscribers for a key.
    pub fn local_subscribers(&self, key: &str) -> Vec<Arc<C>> {
        self.channels
            .get(key)
            .map(|state| state.subscribers.to_vec())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of channel keys with at least one local subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    async fn remove_member(
        &self,
        connection: &Arc<C>,
        key: &str,
    ) -> Result<(), BackplaneError> {
        let emptied = match self.channels.get_mut(key) {
            Some(mut state) => {
                if let Some(pos) = state
                    .subscribers
                    .iter()
                    .position(|s| Arc::ptr_eq(s, connection))
                {
                    state.subscribers.swap_remove(pos);
                }
                state.subscribers.is_empty()
            }
            None => return Ok(()),
        };

        // remove_if is atomic: exactly one caller wins the teardown even
        // when a subscribe re-adds a member between the check and here.
        if emptied
            && self
                .channels
                .remove_if(key, |_, state| state.subscribers.is_empty())
                .is_some()
        {
            CHANNELS_ACTIVE.set(self.channels.len() as i64);
            tracing::debug!(channel = %key, "channel drained, tearing down");
            self.sync_backplane(key).await?;
        }

        Ok(())
    }

    /// Converges the backplane subscription for `key` onto the local map.
    ///
    /// Establishing or tearing down a subscription suspends on a backplane
    /// round-trip, and the local set can change underneath it (the only
    /// source of the original lost-race retry). Re-reading the map after
    /// every awaited call and applying the opposite operation bounds the
    /// loop: another iteration requires another concurrent mutation of the
    /// same key, so the loop quiesces as soon as the key stops churning.
    async fn sync_backplane(&self, key: &str) -> Result<(), BackplaneError> {
        let topic = self.topics.full_key(key);
        loop {
            let want_subscribed = self.channels.contains_key(key);

            if want_subscribed {
                self.backplane
                    .subscribe(&topic, self.delivery_callback())
                    .await?;
            } else {
                self.backplane.unsubscribe(&topic).await?;
            }

            if self.channels.contains_key(key) == want_subscribed {
                return Ok(());
            }
        }
    }

    /// The callback registered on the backplane for every channel topic.
    ///
    /// Decodes the key back out of the topic and looks up the *current*
    /// subscriber set; a set torn down while the message was in flight
    /// drops it silently. Handler failures are caught and logged here and
    /// never terminate the backplane subscription.
    fn delivery_callback(&self) -> TopicCallback {
        let channels = self.channels.clone();
        let topics = self.topics.clone();

        Arc::new(move |topic: String, payload: String| {
            let channels = channels.clone();
            let topics = topics.clone();

            async move {
                let Some(key) = topics.key_from_full_key(&topic) else {
                    tracing::error!(
                        topic = %topic,
                        "backplane topic does not decode to a channel key"
                    );
                    return;
                };

                let (origin, subscribers, on_message) = match channels.get(&key) {
                    Some(state) => (
                        state.origin.clone(),
                        state.subscribers.to_vec(),
                        state.on_message.clone(),
                    ),
                    // Torn down after the last unsubscribe, concurrently
                    // with this in-flight message.
                    None => return,
                };

                let delivered = subscribers.len() as u64;
                if let Err(e) = on_message(payload, origin, subscribers).await {
                    tracing::error!(channel = %key, error = %e, "channel delivery callback failed");
                } else {
                    MESSAGES_DELIVERED_TOTAL.inc_by(delivered);
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::{MemoryBackplane, MemoryBus};
    use crate::channels::topics::PrefixTopics;
    use crate::connection::{Frame, FrameSink, RelayConnection, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, _frame: Frame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, _reason: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn connection() -> Arc<RelayConnection> {
        Arc::new(RelayConnection::new(Arc::new(NullSink)))
    }

    fn noop_delivery() -> DeliveryFn<RelayConnection> {
        Arc::new(|_, _, _| async { Ok(()) }.boxed())
    }

    fn recording_delivery(
        log: Arc<Mutex<Vec<(String, usize)>>>,
    ) -> DeliveryFn<RelayConnection> {
        Arc::new(move |payload, _origin, subscribers| {
            let log = log.clone();
            async move {
                log.lock().expect("log lock poisoned").push((payload, subscribers.len()));
                Ok(())
            }
            .boxed()
        })
    }

    fn multiplexer(
        bus: &Arc<MemoryBus>,
    ) -> ChannelMultiplexer<RelayConnection> {
        ChannelMultiplexer::new(
            Arc::new(MemoryBackplane::connect(bus.clone())),
            Arc::new(PrefixTopics::new("test:channels")),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn one_backplane_subscription_regardless_of_subscriber_count() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);

        for _ in 0..5 {
            mux.subscribe(connection(), "orders", noop_delivery())
                .await
                .expect("subscribe should succeed");
        }

        assert_eq!(mux.subscriber_count("orders"), 5);
        assert_eq!(bus.subscriber_count("test:channels:orders"), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_tears_down_the_backplane_subscription() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);

        let a = connection();
        let b = connection();
        mux.subscribe(a.clone(), "orders", noop_delivery()).await.unwrap();
        mux.subscribe(b.clone(), "orders", noop_delivery()).await.unwrap();

        mux.unsubscribe(&a, "orders").await.unwrap();
        assert!(bus.is_subscribed("test:channels:orders"));

        mux.unsubscribe(&b, "orders").await.unwrap();
        assert!(!bus.is_subscribed("test:channels:orders"));
        assert_eq!(mux.channel_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_of_a_non_member_is_a_no_op() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);

        let member = connection();
        let stranger = connection();
        mux.subscribe(member, "orders", noop_delivery()).await.unwrap();

        mux.unsubscribe(&stranger, "orders").await.unwrap();
        assert_eq!(mux.subscriber_count("orders"), 1);
        assert!(bus.is_subscribed("test:channels:orders"));
    }

    #[tokio::test]
    async fn publish_round_trips_through_the_backplane() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);
        let log = Arc::new(Mutex::new(Vec::new()));

        mux.subscribe(connection(), "room-1", recording_delivery(log.clone()))
            .await
            .unwrap();
        mux.subscribe(connection(), "room-1", noop_delivery()).await.unwrap();

        mux.publish("room-1", "hello").await.unwrap();

        wait_for(|| !log.lock().unwrap().is_empty()).await;
        let delivered = log.lock().unwrap().clone();
        assert_eq!(delivered, vec![("hello".to_string(), 2)]);
    }

    #[tokio::test]
    async fn publish_to_a_channel_with_no_subscribers_is_dropped() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);
        let log = Arc::new(Mutex::new(Vec::new()));

        let conn = connection();
        mux.subscribe(conn.clone(), "room-1", recording_delivery(log.clone()))
            .await
            .unwrap();
        mux.unsubscribe(&conn, "room-1").await.unwrap();

        mux.publish("room-1", "into the void").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_does_not_tear_down_the_subscription() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);
        let log = Arc::new(Mutex::new(Vec::new()));

        let failing_then_logging: DeliveryFn<RelayConnection> = {
            let log = log.clone();
            Arc::new(move |payload, _origin, _subs| {
                let log = log.clone();
                async move {
                    if payload == "boom" {
                        anyhow::bail!("handler exploded");
                    }
                    log.lock().expect("log lock poisoned").push(payload);
                    Ok(())
                }
                .boxed()
            })
        };

        mux.subscribe(connection(), "room-1", failing_then_logging).await.unwrap();

        mux.publish("room-1", "boom").await.unwrap();
        mux.publish("room-1", "still alive").await.unwrap();

        wait_for(|| !log.lock().unwrap().is_empty()).await;
        assert_eq!(log.lock().unwrap().clone(), vec!["still alive".to_string()]);
        assert!(bus.is_subscribed("test:channels:room-1"));
    }

    #[tokio::test]
    async fn unsubscribe_many_survives_unknown_keys() {
        let bus = Arc::new(MemoryBus::new());
        let mux = multiplexer(&bus);

        let conn = connection();
        mux.subscribe(conn.clone(), "a", noop_delivery()).await.unwrap();
        mux.subscribe(conn.clone(), "b", noop_delivery()).await.unwrap();

        let keys = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        mux.unsubscribe_many(&conn, &keys).await;

        assert_eq!(mux.channel_count(), 0);
        assert!(!bus.is_subscribed("test:channels:a"));
        assert!(!bus.is_subscribed("test:channels:b"));
    }

    #[tokio::test]
    async fn interleaved_subscribe_unsubscribe_converges_to_empty() {
        let bus = Arc::new(MemoryBus::new());
        let mux = Arc::new(multiplexer(&bus));

        for _ in 0..50 {
            let c1 = connection();
            let c2 = connection();

            let t1 = {
                let mux = mux.clone();
                let c1 = c1.clone();
                tokio::spawn(async move {
                    mux.subscribe(c1.clone(), "k", noop_delivery()).await.unwrap();
                    mux.unsubscribe(&c1, "k").await.unwrap();
                })
            };
            let t2 = {
                let mux = mux.clone();
                let c2 = c2.clone();
                tokio::spawn(async move {
                    mux.subscribe(c2.clone(), "k", noop_delivery()).await.unwrap();
                    mux.unsubscribe(&c2, "k").await.unwrap();
                })
            };

            t1.await.unwrap();
            t2.await.unwrap();

            assert_eq!(mux.subscriber_count("k"), 0);
            assert!(
                !bus.is_subscribed("test:channels:k"),
                "backplane subscription must be torn down once all subscribers left"
            );
        }
    }
}
