//! Cross-component integration tests
//!
//! These tests drive the registry, the channel multiplexer, and the relay
//! handler together over the in-memory backplane, without server startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;

use lattice_relay_service::backplane::{MemoryBackplane, MemoryBus};
use lattice_relay_service::channels::{ChannelMultiplexer, DeliveryFn, PrefixTopics};
use lattice_relay_service::connection::{
    Frame, FrameSink, RelayConnection, SocketConnection, TransportError,
};
use lattice_relay_service::registry::ConnectionRegistry;
use lattice_relay_service::relay::RelayHandler;
use lattice_relay_service::session::SessionHandler;

/// Write half that records every frame it accepts.
struct RecordingSink {
    open: AtomicBool,
    sent: Mutex<Vec<Frame>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(&self) -> Vec<serde_json::Value> {
        self.sent_texts()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter(|value| value["type"] == "event")
            .collect()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().expect("sent lock poisoned").push(frame);
        Ok(())
    }

    async fn close(&self, _reason: &str) -> Result<(), TransportError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

fn connection_with_sink() -> (Arc<RelayConnection>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let connection = Arc::new(RelayConnection::new(sink.clone() as Arc<dyn FrameSink>));
    (connection, sink)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn thousand_concurrent_registrations_yield_unique_ids() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handles = Vec::new();

    for _ in 0..1000 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let (connection, _sink) = connection_with_sink();
            registry.register(connection)
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let id = handle.await.expect("registration task panicked");
        assert!(ids.insert(id), "registry produced a duplicate id");
    }

    assert_eq!(ids.len(), 1000);
    assert_eq!(registry.all().len(), 1000);
}

#[tokio::test]
async fn concurrent_register_remove_leaves_registry_empty() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handles = Vec::new();

    for _ in 0..200 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let (connection, _sink) = connection_with_sink();
            let id = registry.register(connection);
            registry.remove(&id).await;
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked");
    }

    assert!(registry.is_empty());
}

#[tokio::test]
async fn room_scenario_delivery_carries_origin_and_current_subscribers() {
    let bus = Arc::new(MemoryBus::new());
    let mux: ChannelMultiplexer<RelayConnection> = ChannelMultiplexer::new(
        Arc::new(MemoryBackplane::connect(bus.clone())),
        Arc::new(PrefixTopics::new("test:channels")),
    );

    let (a, _sink_a) = connection_with_sink();
    let (b, _sink_b) = connection_with_sink();

    #[allow(clippy::type_complexity)]
    let log: Arc<Mutex<Vec<(String, Arc<RelayConnection>, Vec<Arc<RelayConnection>>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let delivery: DeliveryFn<RelayConnection> = {
        let log = log.clone();
        Arc::new(move |payload, origin, subscribers| {
            let log = log.clone();
            async move {
                log.lock().expect("log lock poisoned").push((payload, origin, subscribers));
                Ok(())
            }
            .boxed()
        })
    };

    // A is first, so A is the creator whose callback and identity are kept.
    mux.subscribe(a.clone(), "room-1", delivery.clone()).await.unwrap();
    mux.subscribe(b.clone(), "room-1", delivery.clone()).await.unwrap();

    mux.publish("room-1", "hello").await.unwrap();
    wait_until(|| !log.lock().unwrap().is_empty()).await;

    {
        let entries = log.lock().unwrap();
        let (payload, origin, subscribers) = &entries[0];
        assert_eq!(payload, "hello");
        assert!(Arc::ptr_eq(origin, &a));
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.iter().any(|s| Arc::ptr_eq(s, &a)));
        assert!(subscribers.iter().any(|s| Arc::ptr_eq(s, &b)));
    }

    // B leaves; the next publish only sees A in the subscriber list.
    mux.unsubscribe(&b, "room-1").await.unwrap();
    mux.publish("room-1", "hi").await.unwrap();
    wait_until(|| log.lock().unwrap().len() >= 2).await;

    let entries = log.lock().unwrap();
    let (payload, _origin, subscribers) = &entries[1];
    assert_eq!(payload, "hi");
    assert_eq!(subscribers.len(), 1);
    assert!(Arc::ptr_eq(&subscribers[0], &a));
}

#[tokio::test]
async fn relay_protocol_round_trip_over_the_wire_messages() {
    let bus = Arc::new(MemoryBus::new());
    let mux = Arc::new(ChannelMultiplexer::new(
        Arc::new(MemoryBackplane::connect(bus.clone())),
        Arc::new(PrefixTopics::new("test:channels")),
    ));
    let handler = RelayHandler::new(mux.clone());

    let (a, sink_a) = connection_with_sink();
    let (b, sink_b) = connection_with_sink();
    a.set_authorized(true);
    b.set_authorized(true);

    let subscribe = r#"{"type":"subscribe","payload":{"channels":["room-1"]}}"#;
    handler.on_text(&a, subscribe.to_string()).await;
    handler.on_text(&b, subscribe.to_string()).await;

    assert_eq!(mux.subscriber_count("room-1"), 2);
    assert_eq!(bus.subscriber_count("test:channels:room-1"), 1);

    let publish =
        r#"{"type":"publish","payload":{"channel":"room-1","data":{"text":"hello"}}}"#;
    handler.on_text(&a, publish.to_string()).await;

    wait_until(|| !sink_a.events().is_empty() && !sink_b.events().is_empty()).await;
    let events_b = sink_b.events();
    assert_eq!(events_b[0]["channel"], "room-1");
    assert_eq!(events_b[0]["data"], json!({"text": "hello"}));

    // B unsubscribes; the next publish reaches only A.
    let unsubscribe = r#"{"type":"unsubscribe","payload":{"channels":["room-1"]}}"#;
    handler.on_text(&b, unsubscribe.to_string()).await;

    let publish_again =
        r#"{"type":"publish","payload":{"channel":"room-1","data":{"text":"hi"}}}"#;
    handler.on_text(&a, publish_again.to_string()).await;

    wait_until(|| sink_a.events().len() >= 2).await;
    assert_eq!(sink_b.events().len(), 1);
}

#[tokio::test]
async fn disconnect_leaves_all_channels() {
    let bus = Arc::new(MemoryBus::new());
    let mux = Arc::new(ChannelMultiplexer::new(
        Arc::new(MemoryBackplane::connect(bus.clone())),
        Arc::new(PrefixTopics::new("test:channels")),
    ));
    let handler = RelayHandler::new(mux.clone());

    let (conn, _sink) = connection_with_sink();
    conn.set_authorized(true);

    let subscribe = r#"{"type":"subscribe","payload":{"channels":["alpha","beta"]}}"#;
    handler.on_text(&conn, subscribe.to_string()).await;
    assert_eq!(mux.channel_count(), 2);

    handler.on_disconnect(&conn).await;

    assert_eq!(mux.channel_count(), 0);
    assert!(!bus.is_subscribed("test:channels:alpha"));
    assert!(!bus.is_subscribed("test:channels:beta"));
}

#[tokio::test]
async fn sending_to_a_closed_connection_has_no_observable_effect() {
    let (conn, sink) = connection_with_sink();
    sink.close("test").await.expect("close should succeed");

    // The relay send helper silently drops frames for closed transports.
    lattice_relay_service::relay::send(
        &conn,
        &lattice_relay_service::websocket::ServerMessage::Pong,
    )
    .await;

    assert!(sink.sent_texts().is_empty());
}

#[tokio::test]
async fn unauthorized_connections_cannot_publish() {
    let bus = Arc::new(MemoryBus::new());
    let mux = Arc::new(ChannelMultiplexer::new(
        Arc::new(MemoryBackplane::connect(bus.clone())),
        Arc::new(PrefixTopics::new("test:channels")),
    ));
    let handler = RelayHandler::new(mux.clone());

    let (subscriber, subscriber_sink) = connection_with_sink();
    subscriber.set_authorized(true);
    handler
        .on_text(
            &subscriber,
            r#"{"type":"subscribe","payload":{"channels":["room-1"]}}"#.to_string(),
        )
        .await;

    let (publisher, publisher_sink) = connection_with_sink();
    // Not authorized: on_connect never ran for this connection.
    handler
        .on_text(
            &publisher,
            r#"{"type":"publish","payload":{"channel":"room-1","data":1}}"#.to_string(),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subscriber_sink.events().is_empty());

    let replies = publisher_sink.sent_texts();
    assert!(replies[0].contains("NOT_AUTHORIZED"));
}
