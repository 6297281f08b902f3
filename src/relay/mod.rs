//! The relay application handler: a JSON protocol over text frames that
//! lets clients join channels and publish to them, with fanout through the
//! channel multiplexer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::channels::{ChannelMultiplexer, DeliveryFn};
use crate::connection::{ConnectionId, Frame, RelayConnection, SocketConnection};
use crate::session::SessionHandler;
use crate::websocket::{ChannelEnvelope, ClientMessage, ServerMessage};

pub struct RelayHandler {
    multiplexer: Arc<ChannelMultiplexer<RelayConnection>>,
    delivery: DeliveryFn<RelayConnection>,
}

impl RelayHandler {
    pub fn new(multiplexer: Arc<ChannelMultiplexer<RelayConnection>>) -> Self {
        let delivery: DeliveryFn<RelayConnection> = Arc::new(|payload, origin, subscribers| {
            Self::on_channel_message(payload, origin, subscribers).boxed()
        });
        Self {
            multiplexer,
            delivery,
        }
    }

    pub fn multiplexer(&self) -> &Arc<ChannelMultiplexer<RelayConnection>> {
        &self.multiplexer
    }

    /// Delivery callback registered with the multiplexer: decodes the
    /// envelope and fans the event out to every currently-open subscriber.
    async fn on_channel_message(
        payload: String,
        _origin: Arc<RelayConnection>,
        subscribers: Vec<Arc<RelayConnection>>,
    ) -> anyhow::Result<()> {
        let envelope: ChannelEnvelope = serde_json::from_str(&payload)?;
        let event = ServerMessage::Event {
            channel: envelope.channel,
            data: envelope.data,
        };

        for subscriber in subscribers {
            send(&subscriber, &event).await;
        }
        Ok(())
    }

    #[tracing::instrument(name = "relay.subscribe", skip(self, connection), fields(channel_count = channels.len()))]
    async fn handle_subscribe(&self, connection: &Arc<RelayConnection>, channels: Vec<String>) {
        let mut subscribed = Vec::new();
        let mut errors = Vec::new();

        for channel in channels {
            if !is_valid_channel_name(&channel) {
                tracing::warn!(channel = %channel, "invalid channel name");
                errors.push(format!("Invalid channel name: {}", channel));
                continue;
            }

            match self
                .multiplexer
                .subscribe(connection.clone(), &channel, self.delivery.clone())
                .await
            {
                Ok(()) => {
                    connection.track_subscription(&channel).await;
                    subscribed.push(channel);
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "failed to subscribe to channel");
                    errors.push(format!("Subscription failed: {}", channel));
                }
            }
        }

        if !subscribed.is_empty() {
            tracing::info!(channels = ?subscribed, "subscribed to channels");
            send(connection, &ServerMessage::subscribed(subscribed)).await;
        }
        if !errors.is_empty() {
            send(
                connection,
                &ServerMessage::error("SUBSCRIPTION_ERROR", errors.join("; ")),
            )
            .await;
        }
    }

    #[tracing::instrument(name = "relay.unsubscribe", skip(self, connection), fields(channel_count = channels.len()))]
    async fn handle_unsubscribe(&self, connection: &Arc<RelayConnection>, channels: Vec<String>) {
        let mut unsubscribed = Vec::new();

        for channel in channels {
            if let Err(e) = self.multiplexer.unsubscribe(connection, &channel).await {
                tracing::warn!(channel = %channel, error = %e, "failed to unsubscribe from channel");
            }
            connection.untrack_subscription(&channel).await;
            unsubscribed.push(channel);
        }

        if !unsubscribed.is_empty() {
            tracing::info!(channels = ?unsubscribed, "unsubscribed from channels");
            send(connection, &ServerMessage::unsubscribed(unsubscribed)).await;
        }
    }

    #[tracing::instrument(name = "relay.publish", skip(self, connection, data), fields(channel = %channel))]
    async fn handle_publish(
        &self,
        connection: &Arc<RelayConnection>,
        channel: String,
        data: serde_json::Value,
    ) {
        if !connection.is_authorized() {
            send(
                connection,
                &ServerMessage::error("NOT_AUTHORIZED", "publishing requires authorization"),
            )
            .await;
            return;
        }

        if !is_valid_channel_name(&channel) {
            send(
                connection,
                &ServerMessage::error("INVALID_CHANNEL", format!("Invalid channel name: {}", channel)),
            )
            .await;
            return;
        }

        let envelope = ChannelEnvelope {
            channel: channel.clone(),
            data,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize channel envelope");
                return;
            }
        };

        if let Err(e) = self.multiplexer.publish(&channel, &payload).await {
            tracing::warn!(channel = %channel, error = %e, "publish failed");
            send(
                connection,
                &ServerMessage::error("PUBLISH_FAILED", e.to_string()),
            )
            .await;
        }
    }
}

#[async_trait]
impl SessionHandler<RelayConnection> for RelayHandler {
    async fn on_connect(&self, connection: &Arc<RelayConnection>, id: ConnectionId) {
        // Authorization policy lives outside the relay; every accepted
        // connection is marked authorized here.
        connection.set_authorized(true);
        tracing::info!(connection_id = %id, "relay client connected");
    }

    async fn on_disconnect(&self, connection: &Arc<RelayConnection>) {
        let keys = connection.subscription_keys().await;
        if !keys.is_empty() {
            self.multiplexer.unsubscribe_many(connection, &keys).await;
        }
        tracing::info!(channels_left = keys.len(), "relay client disconnected");
    }

    async fn on_text(&self, connection: &Arc<RelayConnection>, text: String) {
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse client message");
                send(
                    connection,
                    &ServerMessage::error("INVALID_MESSAGE", e.to_string()),
                )
                .await;
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { channels } => {
                self.handle_subscribe(connection, channels).await;
            }
            ClientMessage::Unsubscribe { channels } => {
                self.handle_unsubscribe(connection, channels).await;
            }
            ClientMessage::Publish { channel, data } => {
                self.handle_publish(connection, channel, data).await;
            }
            ClientMessage::Ping => {
                send(connection, &ServerMessage::Pong).await;
            }
        }
    }

    async fn on_binary(&self, connection: &Arc<RelayConnection>, _data: Vec<u8>) {
        send(
            connection,
            &ServerMessage::error("UNSUPPORTED_FORMAT", "Binary messages are not supported"),
        )
        .await;
    }
}

/// Serializes and sends a protocol message, dropping it silently if the
/// connection closed in the meantime.
pub async fn send(connection: &RelayConnection, message: &ServerMessage) {
    let text = match serde_json::to_string(message) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server message");
            return;
        }
    };

    let sink = connection.sink();
    if !sink.is_open() {
        return;
    }
    if let Err(e) = sink.send(Frame::Text(text)).await {
        tracing::trace!(error = %e, "dropped message for a closing connection");
    }
}

/// Validate channel name
fn is_valid_channel_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    // Only allow alphanumeric, dash, underscore, and dot
    name.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_channel_names() {
        assert!(is_valid_channel_name("orders"));
        assert!(is_valid_channel_name("system-alerts"));
        assert!(is_valid_channel_name("room_42"));
        assert!(is_valid_channel_name("v1.events"));
        assert!(is_valid_channel_name("Channel123"));
    }

    #[test]
    fn test_invalid_channel_names() {
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("channel with spaces"));
        assert!(!is_valid_channel_name("channel/path"));
        assert!(!is_valid_channel_name("channel@special"));
        // Too long
        assert!(!is_valid_channel_name(&"a".repeat(65)));
    }
}
