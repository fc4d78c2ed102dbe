use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::common::types::{AnyResult, DriverId, ParcelId, now_ms};
use crate::protocol::messages::OutgoingMessage;
use crate::relay::store::{DriverStatus, UpdateOutcome};
use crate::server::AppState;

/// Immutable fact forwarded to the order-fulfillment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryCompletion {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub parcel_id: ParcelId,
    pub occurred_at: u64,
}

/// Outbound contract to the fulfillment service. Fire-and-log-on-error; the
/// fan-out path never waits on it.
#[async_trait]
pub trait DeliveryNotifier: Send + Sync {
    async fn notify_delivery_complete(&self, event: &DeliveryCompletion) -> AnyResult<()>;
}

/// Posts completions as JSON to the configured fulfillment endpoint.
pub struct HttpDeliveryNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpDeliveryNotifier {
    pub fn new(url: String, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl DeliveryNotifier for HttpDeliveryNotifier {
    async fn notify_delivery_complete(&self, event: &DeliveryCompletion) -> AnyResult<()> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no fulfillment endpoint is configured.
pub struct NoopDeliveryNotifier;

#[async_trait]
impl DeliveryNotifier for NoopDeliveryNotifier {
    async fn notify_delivery_complete(&self, event: &DeliveryCompletion) -> AnyResult<()> {
        debug!(
            "no fulfillment endpoint configured, dropping completion for {} / {}",
            event.driver_id, event.parcel_id
        );
        Ok(())
    }
}

/// Routes a delivery-complete message: marks the stored record completed,
/// fans the event out to dashboards, and forwards it downstream on a spawned
/// task so a slow collaborator cannot block the relay.
pub fn handle_delivery_complete(
    state: &Arc<AppState>,
    driver_id: DriverId,
    lat: f64,
    lng: f64,
    point_id: ParcelId,
) {
    let occurred_at = now_ms();

    match state.store.update(
        driver_id.clone(),
        lat,
        lng,
        occurred_at,
        occurred_at,
        DriverStatus::Completed,
    ) {
        UpdateOutcome::Accepted(record) => state.router.fanout_location(&record),
        UpdateOutcome::Rejected(reason) => {
            // The completion event below still goes out; only the position
            // part was unusable.
            debug!(
                "position of completion for {} rejected: {:?}",
                driver_id, reason
            );
        }
    }

    let msg = OutgoingMessage::DeliveryComplete {
        driver_id: driver_id.clone(),
        latitude: lat,
        longitude: lng,
        point_id: point_id.clone(),
        occurred_at,
    };
    state.router.fanout_driver_event(&driver_id, &msg);

    let event = DeliveryCompletion {
        driver_id,
        latitude: lat,
        longitude: lng,
        parcel_id: point_id,
        occurred_at,
    };
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_delivery_complete(&event).await {
            warn!(
                "failed to forward completion for {} / {}: {}",
                event.driver_id, event.parcel_id, e
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::common::types::SubscriberId;
    use crate::config::Config;
    use crate::protocol::topic::Topic;
    use crate::relay::registry::ControlCommand;
    use crate::relay::router::OutboundQueue;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<DeliveryCompletion>>,
    }

    #[async_trait]
    impl DeliveryNotifier for Arc<RecordingNotifier> {
        async fn notify_delivery_complete(&self, event: &DeliveryCompletion) -> AnyResult<()> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    fn subscriber_on_global(
        state: &Arc<AppState>,
    ) -> (
        Arc<crate::relay::registry::SubscriberSession>,
        flume::Receiver<ControlCommand>,
    ) {
        let (ctl_tx, ctl_rx) = flume::unbounded();
        let session = state
            .registry
            .register_subscriber(SubscriberId::from("dash"), OutboundQueue::new(16, 16), ctl_tx)
            .unwrap();
        state.router.subscribe(Topic::AllDrivers, session.clone());
        (session, ctl_rx)
    }

    #[tokio::test]
    async fn completion_updates_store_fans_out_and_forwards() {
        let recorder = Arc::new(RecordingNotifier::default());
        let (mut state, _events) = AppState::new(Config::default());
        state.notifier = Arc::new(recorder.clone());
        let state = Arc::new(state);

        let (subscriber, _ctl) = subscriber_on_global(&state);

        handle_delivery_complete(
            &state,
            DriverId::from("d1"),
            37.5,
            127.0,
            ParcelId::from("p9"),
        );

        // Stored record is completed.
        let record = state.store.get(&DriverId::from("d1")).unwrap();
        assert_eq!(record.status, DriverStatus::Completed);

        // Dashboard saw the completed position and the completion event.
        let drained: Vec<OutgoingMessage> =
            std::iter::from_fn(|| subscriber.queue.try_pop()).collect();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            OutgoingMessage::LocationUpdate {
                status: DriverStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            drained[1],
            OutgoingMessage::DeliveryComplete { ref point_id, .. } if point_id == &ParcelId::from("p9")
        ));

        // The spawned forward reached the collaborator.
        tokio::task::yield_now().await;
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].parcel_id, ParcelId::from("p9"));
    }

    #[tokio::test]
    async fn notifier_failure_never_blocks_fanout() {
        struct FailingNotifier;

        #[async_trait]
        impl DeliveryNotifier for FailingNotifier {
            async fn notify_delivery_complete(&self, _: &DeliveryCompletion) -> AnyResult<()> {
                Err("fulfillment unreachable".into())
            }
        }

        let (mut state, _events) = AppState::new(Config::default());
        state.notifier = Arc::new(FailingNotifier);
        let state = Arc::new(state);

        let (subscriber, _ctl) = subscriber_on_global(&state);
        handle_delivery_complete(
            &state,
            DriverId::from("d1"),
            1.0,
            2.0,
            ParcelId::from("p1"),
        );
        tokio::task::yield_now().await;

        // Fan-out happened regardless of the downstream error.
        assert_eq!(subscriber.queue.len(), 2);
    }
}
