//! Typed in-process event bus
//!
//! One topic per event variant; every subscriber owns a bounded queue per
//! topic. Publish never blocks: a full subscriber queue drops the event for
//! that subscriber only and bumps a per-(subscriber, topic) counter.
//! Ordering within a topic is preserved for a subscriber as long as no drop
//! occurs.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::models::{AgentState, StoredMessage};

/// Emitted once per successfully indexed message
#[derive(Debug, Clone)]
pub struct NewMessageEvent {
    pub user_id: String,
    pub email: String,
    pub message: StoredMessage,
    pub at: String,
}

/// Emitted on every agent state transition
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub user_id: String,
    pub email: String,
    pub state: AgentState,
    pub at: String,
}

struct TopicSubscriber<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

/// Receiving side of one (subscriber, topic) queue
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Subscription<T> {
    /// Receive the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Events dropped for this subscriber on this topic
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// In-process pub/sub hub between the pipeline, the supervisor, and the
/// session hub
pub struct EventBus {
    messages: Mutex<Vec<TopicSubscriber<NewMessageEvent>>>,
    statuses: Mutex<Vec<TopicSubscriber<StatusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the new-message topic with a bounded queue
    pub fn subscribe_messages(&self, capacity: usize) -> Subscription<NewMessageEvent> {
        Self::subscribe(&self.messages, capacity)
    }

    /// Subscribe to the status topic with a bounded queue
    pub fn subscribe_statuses(&self, capacity: usize) -> Subscription<StatusEvent> {
        Self::subscribe(&self.statuses, capacity)
    }

    /// Publish a new-message event to every subscriber, never blocking
    pub fn publish_message(&self, event: NewMessageEvent) {
        Self::publish(&self.messages, event, "new_message");
    }

    /// Publish a status event to every subscriber, never blocking
    pub fn publish_status(&self, event: StatusEvent) {
        Self::publish(&self.statuses, event, "status");
    }

    /// Whether every live subscriber has consumed everything published
    ///
    /// Used by the shutdown path to flush in-flight events before sessions
    /// are closed. Subscribers whose receiver is gone are ignored.
    pub fn is_drained(&self) -> bool {
        Self::topic_drained(&self.messages) && Self::topic_drained(&self.statuses)
    }

    fn topic_drained<T>(subscribers: &Mutex<Vec<TopicSubscriber<T>>>) -> bool {
        subscribers
            .lock()
            .expect("bus lock poisoned")
            .iter()
            .filter(|sub| !sub.tx.is_closed())
            .all(|sub| sub.tx.capacity() == sub.tx.max_capacity())
    }

    fn subscribe<T>(
        subscribers: &Mutex<Vec<TopicSubscriber<T>>>,
        capacity: usize,
    ) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        subscribers
            .lock()
            .expect("bus lock poisoned")
            .push(TopicSubscriber {
                tx,
                dropped: dropped.clone(),
            });
        Subscription { rx, dropped }
    }

    fn publish<T: Clone>(subscribers: &Mutex<Vec<TopicSubscriber<T>>>, event: T, topic: &str) {
        let mut subscribers = subscribers.lock().expect("bus lock poisoned");
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(topic, dropped = total, "subscriber queue full, event dropped");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, StatusEvent};
    use crate::models::{AgentState, now_iso};

    fn status(email: &str, state: AgentState) -> StatusEvent {
        StatusEvent {
            user_id: "u1".to_owned(),
            email: email.to_owned(),
            state,
            at: now_iso(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_statuses(8);

        bus.publish_status(status("a@x.com", AgentState::Starting));
        bus.publish_status(status("a@x.com", AgentState::Syncing));
        bus.publish_status(status("a@x.com", AgentState::Idle));

        assert_eq!(sub.recv().await.unwrap().state, AgentState::Starting);
        assert_eq!(sub.recv().await.unwrap().state, AgentState::Syncing);
        assert_eq!(sub.recv().await.unwrap().state, AgentState::Idle);
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_statuses(2);

        bus.publish_status(status("a@x.com", AgentState::Starting));
        bus.publish_status(status("a@x.com", AgentState::Syncing));
        bus.publish_status(status("a@x.com", AgentState::Idle));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.try_recv().unwrap().state, AgentState::Starting);
        assert_eq!(sub.try_recv().unwrap().state, AgentState::Syncing);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_statuses(1);
        let mut fast = bus.subscribe_statuses(8);

        bus.publish_status(status("a@x.com", AgentState::Starting));
        bus.publish_status(status("a@x.com", AgentState::Syncing));

        assert_eq!(slow.dropped(), 1);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(fast.try_recv().unwrap().state, AgentState::Starting);
        assert_eq!(fast.try_recv().unwrap().state, AgentState::Syncing);
    }

    #[tokio::test]
    async fn is_drained_tracks_pending_events() {
        let bus = EventBus::new();
        assert!(bus.is_drained());

        let mut sub = bus.subscribe_statuses(4);
        assert!(bus.is_drained());

        bus.publish_status(status("a@x.com", AgentState::Starting));
        assert!(!bus.is_drained());

        sub.recv().await.unwrap();
        assert!(bus.is_drained());

        // A gone subscriber with unread events does not block draining.
        bus.publish_status(status("a@x.com", AgentState::Syncing));
        drop(sub);
        assert!(bus.is_drained());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe_statuses(2);
        drop(sub);

        // Publish after the receiver is gone; the dead entry is retained out.
        bus.publish_status(status("a@x.com", AgentState::Starting));
        let mut live = bus.subscribe_statuses(2);
        bus.publish_status(status("a@x.com", AgentState::Syncing));
        assert_eq!(live.try_recv().unwrap().state, AgentState::Syncing);
    }
}
