//! Publish/subscribe fan-out of chain events.
//!
//! Every chain publishes on its own `chain:<id>` topic; all lifecycle events
//! additionally fan into the shared `api` topic. Delivery is at-most-once in
//! publication order per topic. A slow subscriber never blocks a worker: its
//! buffer drops the oldest events and the next read yields one `lag` marker.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use testchain_types::{ChainEvent, ChainEventKind};
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-subscriber buffer size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A subscription target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Fan-in of lifecycle events across all chains.
    Api,
    /// Events of a single chain.
    Chain(String),
}

impl Topic {
    pub fn chain(id: impl Into<String>) -> Self {
        Topic::Chain(id.into())
    }

    fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Api => f.write_str("api"),
            Topic::Chain(id) => write!(f, "chain:{id}"),
        }
    }
}

/// Process-wide notification bus.
pub struct NotificationBus {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<ChainEvent>>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic. Dropping the returned stream unsubscribes;
    /// dropping it twice is naturally idempotent.
    pub fn subscribe(&self, topic: &Topic) -> EventStream {
        let rx = self.sender_for(&topic.key()).subscribe();
        EventStream {
            topic: topic.clone(),
            rx,
        }
    }

    /// Publish an event on its chain topic and the `api` topic.
    pub fn publish(&self, event: ChainEvent) {
        trace!(chain_id = %event.chain_id, event = event.kind.name(), "publish");
        let chain_key = Topic::chain(event.chain_id.clone()).key();
        self.send(&chain_key, event.clone());
        self.send(&Topic::Api.key(), event);
    }

    /// Drop a chain's topic once its worker has exited. Existing
    /// subscribers keep draining events already buffered.
    pub fn drop_topic(&self, chain_id: &str) {
        let key = Topic::chain(chain_id).key();
        self.topics.write().remove(&key);
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .get(&topic.key())
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn send(&self, key: &str, event: ChainEvent) {
        let sender = self.topics.read().get(key).cloned();
        if let Some(sender) = sender {
            // Err means no live receivers; at-most-once delivery drops it.
            let _ = sender.send(event);
        }
    }

    fn sender_for(&self, key: &str) -> broadcast::Sender<ChainEvent> {
        if let Some(sender) = self.topics.read().get(key) {
            return sender.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// A subscriber's view of one topic.
#[derive(Debug)]
pub struct EventStream {
    topic: Topic,
    rx: broadcast::Receiver<ChainEvent>,
}

impl EventStream {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next event in publication order, or `None` once the topic is closed
    /// and drained. A buffer overflow yields a single `lag` marker carrying
    /// the number of missed events.
    pub async fn recv(&mut self) -> Option<ChainEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let chain_id = match &self.topic {
                    Topic::Api => String::new(),
                    Topic::Chain(id) => id.clone(),
                };
                Some(ChainEvent::new(chain_id, ChainEventKind::Lag { missed }))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testchain_types::ChainStatus;

    fn status_event(chain_id: &str, status: ChainStatus) -> ChainEvent {
        ChainEvent::new(chain_id, ChainEventKind::StatusChanged(status))
    }

    #[tokio::test]
    async fn chain_topic_receives_in_publication_order() {
        let bus = NotificationBus::default();
        let mut stream = bus.subscribe(&Topic::chain("1"));

        bus.publish(status_event("1", ChainStatus::Initializing));
        bus.publish(status_event("1", ChainStatus::Active));

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert!(matches!(
            first.kind,
            ChainEventKind::StatusChanged(ChainStatus::Initializing)
        ));
        assert!(matches!(
            second.kind,
            ChainEventKind::StatusChanged(ChainStatus::Active)
        ));
    }

    #[tokio::test]
    async fn api_topic_sees_all_chains() {
        let bus = NotificationBus::default();
        let mut api = bus.subscribe(&Topic::Api);
        let _one = bus.subscribe(&Topic::chain("1"));
        let _two = bus.subscribe(&Topic::chain("2"));

        bus.publish(status_event("1", ChainStatus::Active));
        bus.publish(status_event("2", ChainStatus::Terminating));

        assert_eq!(api.recv().await.unwrap().chain_id, "1");
        assert_eq!(api.recv().await.unwrap().chain_id, "2");
    }

    #[tokio::test]
    async fn chain_topics_are_isolated() {
        let bus = NotificationBus::default();
        let mut one = bus.subscribe(&Topic::chain("1"));
        let mut two = bus.subscribe(&Topic::chain("2"));

        bus.publish(status_event("2", ChainStatus::Active));
        bus.publish(status_event("1", ChainStatus::Failed));

        assert_eq!(one.recv().await.unwrap().chain_id, "1");
        assert_eq!(two.recv().await.unwrap().chain_id, "2");
    }

    #[tokio::test]
    async fn both_subscribers_get_each_event() {
        let bus = NotificationBus::default();
        let mut a = bus.subscribe(&Topic::chain("1"));
        let mut b = bus.subscribe(&Topic::chain("1"));

        bus.publish(status_event("1", ChainStatus::Active));

        assert_eq!(a.recv().await.unwrap().chain_id, "1");
        assert_eq!(b.recv().await.unwrap().chain_id, "1");
    }

    #[tokio::test]
    async fn overflow_yields_single_lag_marker() {
        let bus = NotificationBus::new(2);
        let mut stream = bus.subscribe(&Topic::chain("1"));

        for _ in 0..5 {
            bus.publish(status_event("1", ChainStatus::Active));
        }

        let first = stream.recv().await.unwrap();
        match first.kind {
            ChainEventKind::Lag { missed } => assert_eq!(missed, 3),
            other => panic!("expected lag marker, got {other:?}"),
        }
        // The remaining buffered events still arrive.
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = NotificationBus::default();
        bus.publish(status_event("ghost", ChainStatus::Active));
        assert_eq!(bus.subscriber_count(&Topic::chain("ghost")), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_drop() {
        let bus = NotificationBus::default();
        let stream = bus.subscribe(&Topic::chain("1"));
        assert_eq!(bus.subscriber_count(&Topic::chain("1")), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(&Topic::chain("1")), 0);
    }
}
