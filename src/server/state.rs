use std::sync::Arc;

use crate::backplane::Backplane;
use crate::channels::{ChannelMultiplexer, PrefixTopics};
use crate::config::Settings;
use crate::connection::{ConnectionFactory, RelayConnection};
use crate::registry::ConnectionRegistry;
use crate::relay::RelayHandler;
use crate::session::SessionDriver;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry<RelayConnection>>,
    pub multiplexer: Arc<ChannelMultiplexer<RelayConnection>>,
    pub driver: Arc<SessionDriver<RelayConnection, RelayHandler>>,
    pub connection_factory: ConnectionFactory<RelayConnection>,
}

impl AppState {
    pub fn new(settings: Settings, backplane: Arc<dyn Backplane>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let topics = Arc::new(PrefixTopics::new(settings.backplane.topic_prefix.clone()));
        let multiplexer = Arc::new(ChannelMultiplexer::new(backplane, topics));
        let handler = Arc::new(RelayHandler::new(multiplexer.clone()));
        let driver = Arc::new(SessionDriver::new(registry.clone(), handler));

        // Injected so applications can wrap the transport in their own
        // connection type.
        let connection_factory: ConnectionFactory<RelayConnection> =
            Arc::new(|sink| Arc::new(RelayConnection::new(sink)));

        Self {
            settings: Arc::new(settings),
            registry,
            multiplexer,
            driver,
            connection_factory,
        }
    }
}
