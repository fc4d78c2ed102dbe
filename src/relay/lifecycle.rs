use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info};

use crate::common::types::{DriverId, now_ms};
use crate::protocol::messages::OutgoingMessage;
use crate::relay::registry::{CloseReason, ControlCommand};
use crate::server::AppState;

/// Connection-state transitions emitted by the registry and consumed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PublisherConnected(DriverId),
    PublisherDisconnected {
        driver_id: DriverId,
        reason: CloseReason,
    },
}

/// Owns heartbeat-timeout detection and the connect/disconnect fan-out.
///
/// Timeout detection runs on a periodic sweep rather than per inbound packet,
/// and a timed-out connection is told to close through its own control
/// channel: the close lands between messages, never during one.
pub struct LifecycleManager {
    state: Arc<AppState>,
    events: flume::Receiver<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(state: Arc<AppState>, events: flume::Receiver<LifecycleEvent>) -> Self {
        Self { state, events }
    }

    pub async fn run(self) {
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.state.config.relay.heartbeat_interval_ms,
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Ok(event) = self.events.recv_async() => self.handle_event(event),
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    pub fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::PublisherConnected(driver_id) => {
                let msg = OutgoingMessage::ConnectionState {
                    driver_id: driver_id.clone(),
                    connected: true,
                };
                self.state.router.fanout_driver_event(&driver_id, &msg);
            }
            LifecycleEvent::PublisherDisconnected { driver_id, reason } => {
                debug!("publisher {} went away: {:?}", driver_id, reason);
                // Last coordinates are kept and flagged, not cleared, so
                // dashboards show "last seen" instead of an empty map.
                self.state.store.mark_stale(&driver_id);
                let msg = OutgoingMessage::ConnectionState {
                    driver_id: driver_id.clone(),
                    connected: false,
                };
                self.state.router.fanout_driver_event(&driver_id, &msg);
            }
        }
    }

    /// One pass of heartbeat-timeout detection and grace eviction.
    pub fn sweep(&self) {
        let now = now_ms();
        let timeout = self.state.config.heartbeat_timeout_ms();

        for session in self.state.registry.publishers_snapshot() {
            let last = session.last_heartbeat_at.load(Ordering::Relaxed);
            if session.is_connected() && now.saturating_sub(last) > timeout {
                info!(
                    "heartbeat timeout for driver {} ({}ms silent)",
                    session.driver_id,
                    now.saturating_sub(last)
                );
                let _ = session
                    .control
                    .send(ControlCommand::Close(CloseReason::HeartbeatTimeout));
            }
        }

        for session in self.state.registry.subscribers_snapshot() {
            let last = session.last_heartbeat_at.load(Ordering::Relaxed);
            if session.is_connected() && now.saturating_sub(last) > timeout {
                info!(
                    "heartbeat timeout for subscriber {} ({}ms silent)",
                    session.subscriber_id,
                    now.saturating_sub(last)
                );
                let _ = session
                    .control
                    .send(ControlCommand::Close(CloseReason::HeartbeatTimeout));
            }
        }

        let grace_ms = self.state.config.relay.disconnect_grace_secs * 1_000;
        for driver_id in self.state.registry.evict_expired(grace_ms) {
            // The session is gone; the location record stays until an
            // explicit removal.
            debug!("evicted expired session for driver {}", driver_id);
        }
    }
}
