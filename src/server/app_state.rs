use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::delivery::{DeliveryNotifier, HttpDeliveryNotifier, NoopDeliveryNotifier};
use crate::relay::lifecycle::LifecycleEvent;
use crate::relay::registry::ConnectionRegistry;
use crate::relay::router::TopicRouter;
use crate::relay::store::LocationStore;

/// Top-level application state shared by every connection handler.
pub struct AppState {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pub store: LocationStore,
    pub router: TopicRouter,
    pub notifier: Arc<dyn DeliveryNotifier>,
    pub start_time: Instant,
}

impl AppState {
    /// Builds the state and the lifecycle-event stream the registry feeds.
    pub fn new(config: Config) -> (Self, flume::Receiver<LifecycleEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let registry = ConnectionRegistry::new(
            config.relay.duplicate_publisher,
            config.relay.max_subscribers,
            events_tx,
        );
        let notifier: Arc<dyn DeliveryNotifier> = match &config.delivery.fulfillment_url {
            Some(url) => Arc::new(HttpDeliveryNotifier::new(
                url.clone(),
                config.delivery.timeout_ms,
            )),
            None => Arc::new(NoopDeliveryNotifier),
        };

        let state = Self {
            config,
            registry,
            store: LocationStore::new(),
            router: TopicRouter::new(),
            notifier,
            start_time: Instant::now(),
        };
        (state, events_rx)
    }
}
