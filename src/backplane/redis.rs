//! Redis pub/sub backplane.
//!
//! Pub/sub requires a dedicated connection, so a single driver task owns it
//! and everything else talks to the driver through a command channel. The
//! driver keeps the desired topic → callback map; on connection loss it
//! reconnects with exponential backoff and re-subscribes every topic, and
//! commands arriving while disconnected simply update the desired map so
//! the next connection converges on it.

use std::collections::HashMap;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{Backplane, BackplaneError, ExponentialBackoff, TopicCallback};
use crate::metrics::BACKPLANE_RECONNECTS_TOTAL;

const COMMAND_BUFFER_SIZE: usize = 64;

enum Command {
    Subscribe {
        topic: String,
        callback: TopicCallback,
        ack: oneshot::Sender<Result<(), BackplaneError>>,
    },
    Unsubscribe {
        topic: String,
        ack: oneshot::Sender<Result<(), BackplaneError>>,
    },
}

pub struct RedisBackplane {
    commands: mpsc::Sender<Command>,
    publisher: ConnectionManager,
    shutdown: broadcast::Sender<()>,
}

impl RedisBackplane {
    /// Connects the publisher and spawns the subscriber driver task.
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(url)
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;

        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(async move {
            Driver::new(client, command_rx, shutdown_rx).run().await;
        });

        Ok(Self {
            commands,
            publisher,
            shutdown,
        })
    }

    /// Signals the driver task to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn send_command(
        &self,
        command: Command,
        ack: oneshot::Receiver<Result<(), BackplaneError>>,
    ) -> Result<(), BackplaneError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BackplaneError::Closed)?;
        ack.await.map_err(|_| BackplaneError::Closed)?
    }
}

#[async_trait::async_trait]
impl Backplane for RedisBackplane {
    async fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<(), BackplaneError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(
            Command::Subscribe {
                topic: topic.to_string(),
                callback,
                ack: ack_tx,
            },
            ack_rx,
        )
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(
            Command::Unsubscribe {
                topic: topic.to_string(),
                ack: ack_tx,
            },
            ack_rx,
        )
        .await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BackplaneError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| BackplaneError::Command(e.to_string()))?;
        Ok(())
    }
}

enum DriverEvent {
    Shutdown,
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

struct Driver {
    client: redis::Client,
    commands: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
    topics: HashMap<String, TopicCallback>,
}

impl Driver {
    fn new(
        client: redis::Client,
        commands: mpsc::Receiver<Command>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            client,
            commands,
            shutdown,
            topics: HashMap::new(),
        }
    }

    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new();

        loop {
            match self.client.get_async_pubsub().await {
                Ok(pubsub) => {
                    match self.drive_connection(pubsub, &mut backoff).await {
                        ConnectionOutcome::Stop => {
                            tracing::info!("Redis backplane driver stopped");
                            return;
                        }
                        ConnectionOutcome::Reconnect => {
                            BACKPLANE_RECONNECTS_TOTAL.inc();
                            if !self.wait_before_reconnect(backoff.next_delay()).await {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %e,
                        retry_delay_ms = delay.as_millis(),
                        "Redis pub/sub connection failed, retrying"
                    );
                    if !self.wait_before_reconnect(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one pub/sub connection until it breaks or the driver is asked
    /// to stop.
    async fn drive_connection(
        &mut self,
        mut pubsub: redis::aio::PubSub,
        backoff: &mut ExponentialBackoff,
    ) -> ConnectionOutcome {
        for topic in self.topics.keys() {
            if let Err(e) = pubsub.subscribe(topic).await {
                tracing::warn!(topic = %topic, error = %e, "failed to re-subscribe after reconnect");
                return ConnectionOutcome::Reconnect;
            }
        }

        // The connection is only considered healthy once every desired
        // subscription is in place.
        backoff.reset();

        if !self.topics.is_empty() {
            tracing::info!(topics = self.topics.len(), "Redis backplane subscriptions established");
        }

        loop {
            // The message stream borrows the pub/sub connection, so the
            // select is scoped and the event handled after the stream drops.
            let event = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    biased;
                    _ = self.shutdown.recv() => DriverEvent::Shutdown,
                    cmd = self.commands.recv() => DriverEvent::Command(cmd),
                    msg = stream.next() => DriverEvent::Message(msg),
                }
            };

            match event {
                DriverEvent::Shutdown | DriverEvent::Command(None) => {
                    return ConnectionOutcome::Stop;
                }
                DriverEvent::Command(Some(command)) => {
                    self.apply_command(&mut pubsub, command).await;
                }
                DriverEvent::Message(Some(msg)) => {
                    self.dispatch(msg);
                }
                DriverEvent::Message(None) => {
                    tracing::warn!("Redis pub/sub stream ended, reconnecting");
                    return ConnectionOutcome::Reconnect;
                }
            }
        }
    }

    async fn apply_command(&mut self, pubsub: &mut redis::aio::PubSub, command: Command) {
        match command {
            Command::Subscribe { topic, callback, ack } => {
                let result = pubsub
                    .subscribe(&topic)
                    .await
                    .map_err(|e| BackplaneError::Command(e.to_string()));
                if result.is_ok() {
                    self.topics.insert(topic, callback);
                }
                let _ = ack.send(result);
            }
            Command::Unsubscribe { topic, ack } => {
                self.topics.remove(&topic);
                let result = pubsub
                    .unsubscribe(&topic)
                    .await
                    .map_err(|e| BackplaneError::Command(e.to_string()));
                let _ = ack.send(result);
            }
        }
    }

    fn dispatch(&self, msg: redis::Msg) {
        let topic = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "failed to decode backplane payload");
                return;
            }
        };

        match self.topics.get(&topic) {
            Some(callback) => {
                let callback = callback.clone();
                // Dispatched on its own task so a slow delivery callback
                // cannot stall the pub/sub stream.
                tokio::spawn(async move {
                    callback(topic, payload).await;
                });
            }
            None => {
                tracing::debug!(topic = %topic, "message for a topic with no registered callback");
            }
        }
    }

    /// Sleeps out the backoff delay while still applying commands to the
    /// desired-topic map, so callers are never blocked on a dead broker.
    /// Returns false if the driver should stop.
    async fn wait_before_reconnect(&mut self, delay: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => return false,
                cmd = self.commands.recv() => match cmd {
                    None => return false,
                    Some(Command::Subscribe { topic, callback, ack }) => {
                        // Recorded as desired; takes effect on reconnect.
                        self.topics.insert(topic, callback);
                        let _ = ack.send(Ok(()));
                    }
                    Some(Command::Unsubscribe { topic, ack }) => {
                        self.topics.remove(&topic);
                        let _ = ack.send(Ok(()));
                    }
                },
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }
}

enum ConnectionOutcome {
    Stop,
    Reconnect,
}
