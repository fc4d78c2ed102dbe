use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::common::errors::RelayError;
use crate::common::types::{ConnectionId, DriverId, SubscriberId, now_ms};
use crate::config::DuplicatePublisherPolicy;
use crate::protocol::topic::Topic;
use crate::relay::lifecycle::LifecycleEvent;
use crate::relay::router::OutboundQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// Terminal. Disconnected publisher sessions linger until the grace
    /// period expires so dashboards can still resolve "last seen".
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ProtocolError,
    HeartbeatTimeout,
    /// The same driver id reconnected and took over.
    Replaced,
    /// Outbound event backlog exceeded the hard limit.
    Overloaded,
}

/// Commands delivered to a connection task through its own channel, so a
/// server-initiated close is applied between messages and never races with
/// in-flight handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Close(CloseReason),
}

/// One active driver (publisher) connection.
#[derive(Debug)]
pub struct PublisherSession {
    pub driver_id: DriverId,
    pub connection_id: ConnectionId,
    state: RwLock<SessionState>,
    pub last_heartbeat_at: AtomicU64,
    disconnected_at: AtomicU64,
    pub control: flume::Sender<ControlCommand>,
}

impl PublisherSession {
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn touch(&self) {
        self.last_heartbeat_at.store(now_ms(), Ordering::Relaxed);
    }

    fn mark_disconnected(&self) {
        *self.state.write() = SessionState::Disconnected;
        self.disconnected_at.store(now_ms(), Ordering::Relaxed);
    }

    pub fn disconnected_at(&self) -> u64 {
        self.disconnected_at.load(Ordering::Relaxed)
    }
}

/// One active dashboard (subscriber) connection.
#[derive(Debug)]
pub struct SubscriberSession {
    pub subscriber_id: SubscriberId,
    pub connection_id: ConnectionId,
    /// Topics this connection currently receives fan-out for.
    pub topics: Mutex<HashSet<Topic>>,
    /// Bounded outbound queue drained by the socket task.
    pub queue: OutboundQueue,
    state: RwLock<SessionState>,
    pub last_heartbeat_at: AtomicU64,
    pub control: flume::Sender<ControlCommand>,
}

impl SubscriberSession {
    pub fn new(
        subscriber_id: SubscriberId,
        queue: OutboundQueue,
        control: flume::Sender<ControlCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriber_id,
            connection_id: ConnectionId::generate(),
            topics: Mutex::new(HashSet::new()),
            queue,
            state: RwLock::new(SessionState::Connected),
            last_heartbeat_at: AtomicU64::new(now_ms()),
            control,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn touch(&self) {
        self.last_heartbeat_at.store(now_ms(), Ordering::Relaxed);
    }
}

enum ConnectionHandle {
    Publisher(Arc<PublisherSession>),
    Subscriber(Arc<SubscriberSession>),
}

/// Single source of truth for who is connected right now, in both roles.
pub struct ConnectionRegistry {
    publishers: DashMap<DriverId, Arc<PublisherSession>>,
    subscribers: DashMap<ConnectionId, Arc<SubscriberSession>>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    events: flume::Sender<LifecycleEvent>,
    policy: DuplicatePublisherPolicy,
    max_subscribers: usize,
}

impl ConnectionRegistry {
    pub fn new(
        policy: DuplicatePublisherPolicy,
        max_subscribers: usize,
        events: flume::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            connections: DashMap::new(),
            events,
            policy,
            max_subscribers,
        }
    }

    /// Registers a driver connection. A live session for the same driver id
    /// is replaced (the old connection is force-closed) or rejected,
    /// depending on the configured policy.
    pub fn register_publisher(
        &self,
        driver_id: DriverId,
        control: flume::Sender<ControlCommand>,
    ) -> Result<Arc<PublisherSession>, RelayError> {
        let session = Arc::new(PublisherSession {
            driver_id: driver_id.clone(),
            connection_id: ConnectionId::generate(),
            state: RwLock::new(SessionState::Connecting),
            last_heartbeat_at: AtomicU64::new(now_ms()),
            disconnected_at: AtomicU64::new(0),
            control,
        });

        match self.publishers.entry(driver_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().clone();
                if existing.is_connected() {
                    match self.policy {
                        DuplicatePublisherPolicy::Reject => {
                            warn!("rejecting duplicate publisher for driver {}", driver_id);
                            return Err(RelayError::DuplicateConnection(driver_id));
                        }
                        DuplicatePublisherPolicy::Replace => {
                            info!(
                                "driver {} reconnected, replacing connection {}",
                                driver_id, existing.connection_id
                            );
                            existing.mark_disconnected();
                            let _ = existing
                                .control
                                .send(ControlCommand::Close(CloseReason::Replaced));
                        }
                    }
                }
                self.connections.remove(&existing.connection_id);
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }

        self.connections.insert(
            session.connection_id.clone(),
            ConnectionHandle::Publisher(session.clone()),
        );
        *session.state.write() = SessionState::Connected;
        let _ = self
            .events
            .send(LifecycleEvent::PublisherConnected(driver_id));
        Ok(session)
    }

    /// Registers a dashboard connection; refused past the configured maximum.
    pub fn register_subscriber(
        &self,
        subscriber_id: SubscriberId,
        queue: OutboundQueue,
        control: flume::Sender<ControlCommand>,
    ) -> Result<Arc<SubscriberSession>, RelayError> {
        if self.subscribers.len() >= self.max_subscribers {
            warn!(
                "refusing subscriber {}: capacity {} reached",
                subscriber_id, self.max_subscribers
            );
            return Err(RelayError::CapacityExceeded);
        }

        let session = SubscriberSession::new(subscriber_id, queue, control);

        self.subscribers
            .insert(session.connection_id.clone(), session.clone());
        self.connections.insert(
            session.connection_id.clone(),
            ConnectionHandle::Subscriber(session.clone()),
        );
        Ok(session)
    }

    /// Records a liveness signal for either role.
    pub fn heartbeat(&self, connection_id: &ConnectionId) -> Result<(), RelayError> {
        match self.connections.get(connection_id) {
            Some(handle) => {
                match handle.value() {
                    ConnectionHandle::Publisher(s) => s.touch(),
                    ConnectionHandle::Subscriber(s) => s.touch(),
                }
                Ok(())
            }
            None => Err(RelayError::UnknownConnection(connection_id.clone())),
        }
    }

    /// Transitions a connection to `Disconnected`. For a publisher that still
    /// owns its driver-id slot this emits the lifecycle event consumed by the
    /// store and router; a replaced connection closes silently.
    pub fn close(&self, connection_id: &ConnectionId, reason: CloseReason) {
        let Some((_, handle)) = self.connections.remove(connection_id) else {
            return;
        };
        match handle {
            ConnectionHandle::Publisher(session) => {
                session.mark_disconnected();
                let still_current = self
                    .publishers
                    .get(&session.driver_id)
                    .map(|current| current.connection_id == session.connection_id)
                    .unwrap_or(false);
                if still_current {
                    info!(
                        "driver {} disconnected ({:?})",
                        session.driver_id, reason
                    );
                    let _ = self.events.send(LifecycleEvent::PublisherDisconnected {
                        driver_id: session.driver_id.clone(),
                        reason,
                    });
                }
            }
            ConnectionHandle::Subscriber(session) => {
                *session.state.write() = SessionState::Disconnected;
                self.subscribers.remove(&session.connection_id);
                info!(
                    "subscriber {} disconnected ({:?})",
                    session.subscriber_id, reason
                );
            }
        }
    }

    /// Evicts publisher sessions that have been disconnected longer than the
    /// grace period, and their location records are left to the caller.
    pub fn evict_expired(&self, grace_ms: u64) -> Vec<DriverId> {
        let now = now_ms();
        let expired: Vec<DriverId> = self
            .publishers
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.state() == SessionState::Disconnected
                    && now.saturating_sub(s.disconnected_at()) > grace_ms
            })
            .map(|entry| entry.key().clone())
            .collect();
        for driver_id in &expired {
            self.publishers.remove(driver_id);
        }
        expired
    }

    pub fn publishers_snapshot(&self) -> Vec<Arc<PublisherSession>> {
        self.publishers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn subscribers_snapshot(&self) -> Vec<Arc<SubscriberSession>> {
        self.subscribers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connected_publishers(&self) -> usize {
        self.publishers
            .iter()
            .filter(|e| e.value().is_connected())
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(policy: DuplicatePublisherPolicy, max: usize) -> ConnectionRegistry {
        let (tx, rx) = flume::unbounded();
        // Keep the receiver alive for the registry's lifetime in tests.
        std::mem::forget(rx);
        ConnectionRegistry::new(policy, max, tx)
    }

    fn registry_with_events(
        policy: DuplicatePublisherPolicy,
    ) -> (ConnectionRegistry, flume::Receiver<LifecycleEvent>) {
        let (tx, rx) = flume::unbounded();
        (ConnectionRegistry::new(policy, 16, tx), rx)
    }

    #[test]
    fn replace_policy_force_closes_the_old_connection() {
        let reg = registry(DuplicatePublisherPolicy::Replace, 16);
        let (ctl1_tx, ctl1_rx) = flume::unbounded();
        let (ctl2_tx, ctl2_rx) = flume::unbounded();

        let first = reg
            .register_publisher(DriverId::from("d1"), ctl1_tx)
            .unwrap();
        let second = reg
            .register_publisher(DriverId::from("d1"), ctl2_tx)
            .unwrap();

        assert_eq!(
            ctl1_rx.try_recv().unwrap(),
            ControlCommand::Close(CloseReason::Replaced)
        );
        assert!(ctl2_rx.try_recv().is_err());
        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(reg.connected_publishers(), 1);
    }

    #[test]
    fn reject_policy_refuses_the_second_connection() {
        let reg = registry(DuplicatePublisherPolicy::Reject, 16);
        let (ctl_tx, _ctl_rx) = flume::unbounded();
        reg.register_publisher(DriverId::from("d1"), ctl_tx.clone())
            .unwrap();

        let err = reg
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap_err();
        assert_eq!(err, RelayError::DuplicateConnection(DriverId::from("d1")));
    }

    #[test]
    fn reconnect_after_close_is_allowed_under_reject_policy() {
        let reg = registry(DuplicatePublisherPolicy::Reject, 16);
        let (ctl_tx, _ctl_rx) = flume::unbounded();
        let first = reg
            .register_publisher(DriverId::from("d1"), ctl_tx.clone())
            .unwrap();
        reg.close(&first.connection_id, CloseReason::ClientClosed);

        assert!(reg.register_publisher(DriverId::from("d1"), ctl_tx).is_ok());
    }

    #[test]
    fn subscriber_capacity_is_enforced() {
        let reg = registry(DuplicatePublisherPolicy::Replace, 2);
        for i in 0..2 {
            let (ctl_tx, _rx) = flume::unbounded();
            reg.register_subscriber(
                SubscriberId::from(format!("s{}", i).as_str()),
                OutboundQueue::new(8, 8),
                ctl_tx,
            )
            .unwrap();
        }
        let (ctl_tx, _rx) = flume::unbounded();
        let err = reg
            .register_subscriber(SubscriberId::from("s2"), OutboundQueue::new(8, 8), ctl_tx)
            .unwrap_err();
        assert_eq!(err, RelayError::CapacityExceeded);
    }

    #[test]
    fn heartbeat_requires_a_live_connection() {
        let reg = registry(DuplicatePublisherPolicy::Replace, 16);
        let (ctl_tx, _rx) = flume::unbounded();
        let session = reg
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap();

        assert!(reg.heartbeat(&session.connection_id).is_ok());
        reg.close(&session.connection_id, CloseReason::ClientClosed);
        assert_eq!(
            reg.heartbeat(&session.connection_id),
            Err(RelayError::UnknownConnection(session.connection_id.clone()))
        );
    }

    #[test]
    fn replaced_connection_close_emits_no_disconnect_event() {
        let (reg, events) = registry_with_events(DuplicatePublisherPolicy::Replace);
        let (ctl1_tx, _r1) = flume::unbounded();
        let (ctl2_tx, _r2) = flume::unbounded();

        let first = reg
            .register_publisher(DriverId::from("d1"), ctl1_tx)
            .unwrap();
        reg.register_publisher(DriverId::from("d1"), ctl2_tx)
            .unwrap();

        // Old socket task winds down after being told to close.
        reg.close(&first.connection_id, CloseReason::Replaced);

        let seen: Vec<LifecycleEvent> = events.drain().collect();
        assert_eq!(
            seen,
            vec![
                LifecycleEvent::PublisherConnected(DriverId::from("d1")),
                LifecycleEvent::PublisherConnected(DriverId::from("d1")),
            ]
        );
    }

    #[test]
    fn grace_eviction_removes_only_expired_sessions() {
        let reg = registry(DuplicatePublisherPolicy::Replace, 16);
        let (ctl_tx, _rx) = flume::unbounded();
        let session = reg
            .register_publisher(DriverId::from("d1"), ctl_tx)
            .unwrap();
        reg.close(&session.connection_id, CloseReason::HeartbeatTimeout);

        // Still within grace.
        assert!(reg.evict_expired(60_000).is_empty());
        // Grace of zero expires it as soon as any time has passed.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(reg.evict_expired(0), vec![DriverId::from("d1")]);
        assert!(reg.publishers_snapshot().is_empty());
    }
}
