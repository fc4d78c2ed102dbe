use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::common::types::ConnectionId;
use crate::protocol::messages::OutgoingMessage;
use crate::protocol::topic::Topic;
use crate::relay::registry::{CloseReason, ControlCommand, SubscriberSession};
use crate::relay::store::LocationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest buffered position update was dropped in
    /// favor of this one.
    Coalesced,
    /// The queue held only non-droppable events, so this position update was
    /// discarded instead.
    Dropped,
    /// Non-droppable backlog exceeded the hard limit; the subscriber must be
    /// closed.
    Overloaded,
}

/// Bounded outbound queue owned by one subscriber connection.
///
/// Position updates are coalesced under backpressure because only the latest
/// point matters for a live map. Delivery completions and connection-state
/// changes are buffered past the soft capacity, up to a hard limit.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutgoingMessage>>,
    notify: Notify,
    capacity: usize,
    event_limit: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize, event_limit: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            event_limit,
        }
    }

    pub fn push(&self, msg: OutgoingMessage) -> PushOutcome {
        let outcome = {
            let mut queue = self.inner.lock();
            if msg.is_coalescable() && queue.len() >= self.capacity {
                match queue.iter().position(|m| m.is_coalescable()) {
                    Some(oldest) => {
                        queue.remove(oldest);
                        queue.push_back(msg);
                        PushOutcome::Coalesced
                    }
                    None => PushOutcome::Dropped,
                }
            } else if !msg.is_coalescable() {
                let backlog = queue.iter().filter(|m| !m.is_coalescable()).count();
                if backlog >= self.event_limit {
                    return PushOutcome::Overloaded;
                }
                queue.push_back(msg);
                PushOutcome::Queued
            } else {
                queue.push_back(msg);
                PushOutcome::Queued
            }
        };
        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<OutgoingMessage> {
        self.inner.lock().pop_front()
    }

    /// Waits for the next message. Cancellation-safe: a message is only
    /// removed when returned.
    pub async fn pop(&self) -> OutgoingMessage {
        loop {
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Explicit topic-to-subscriber-set mapping. The router instance is passed to
/// every component that publishes or subscribes; there are no hidden
/// singletons.
#[derive(Default)]
pub struct TopicRouter {
    topics: DashMap<Topic, HashMap<ConnectionId, Arc<SubscriberSession>>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a subscriber to a topic. Subscribing to a driver that has
    /// never connected is allowed; messages flow once the driver appears.
    pub fn subscribe(&self, topic: Topic, session: Arc<SubscriberSession>) {
        session.topics.lock().insert(topic.clone());
        self.topics
            .entry(topic)
            .or_default()
            .insert(session.connection_id.clone(), session);
    }

    pub fn unsubscribe(&self, topic: &Topic, session: &Arc<SubscriberSession>) {
        session.topics.lock().remove(topic);
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&session.connection_id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Detaches a subscriber from everything it was subscribed to; called on
    /// connection teardown.
    pub fn unsubscribe_all(&self, session: &Arc<SubscriberSession>) {
        let topics: Vec<Topic> = session.topics.lock().drain().collect();
        for topic in &topics {
            if let Some(mut subscribers) = self.topics.get_mut(topic) {
                subscribers.remove(&session.connection_id);
            }
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
    }

    /// Delivers a message to every subscriber of one topic.
    pub fn publish(&self, topic: &Topic, msg: &OutgoingMessage) {
        let subscribers = match self.topics.get(topic) {
            Some(entry) => entry.values().cloned().collect::<Vec<_>>(),
            None => return,
        };
        for session in subscribers {
            self.deliver(&session, msg.clone());
        }
    }

    /// Fans an accepted location update out to the global topic and the
    /// driver's own topic, delivering once per connection.
    pub fn fanout_location(&self, record: &LocationRecord) {
        let msg = OutgoingMessage::location_update(record);
        self.fanout_driver_event(&record.driver_id, &msg);
    }

    /// Delivers a driver-scoped message (connection-state flip, delivery
    /// completion) to the union of the global and per-driver audiences,
    /// once per connection.
    pub fn fanout_driver_event(&self, driver_id: &crate::common::types::DriverId, msg: &OutgoingMessage) {
        let driver_topic = Topic::Driver(driver_id.clone());
        let mut audience: HashMap<ConnectionId, Arc<SubscriberSession>> = HashMap::new();
        for topic in [&Topic::AllDrivers, &driver_topic] {
            if let Some(entry) = self.topics.get(topic) {
                for (id, session) in entry.iter() {
                    audience.insert(id.clone(), session.clone());
                }
            }
        }
        for session in audience.into_values() {
            self.deliver(&session, msg.clone());
        }
    }

    fn deliver(&self, session: &Arc<SubscriberSession>, msg: OutgoingMessage) {
        match session.queue.push(msg) {
            PushOutcome::Queued => {}
            PushOutcome::Coalesced | PushOutcome::Dropped => {
                debug!(
                    "coalesced position update for slow subscriber {}",
                    session.subscriber_id
                );
            }
            PushOutcome::Overloaded => {
                warn!(
                    "subscriber {} overloaded, closing connection {}",
                    session.subscriber_id, session.connection_id
                );
                let _ = session
                    .control
                    .send(ControlCommand::Close(CloseReason::Overloaded));
            }
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
