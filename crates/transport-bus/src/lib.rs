//! Topic-keyed event fan-out used behind the transport channel.
//!
//! Inbound frames are published under their event name; every listener holds a
//! [`Subscription`] for one topic. Dropping the subscription unsubscribes.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged behind; {0} messages dropped")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription;
    /// Delivers `payload` to every live subscriber of `topic` and returns how
    /// many were reached. Publishing to a topic nobody listens on is not an
    /// error.
    fn publish(&self, topic: &str, payload: Bytes) -> usize;
    fn subscriber_count(&self, topic: &str) -> usize;
}

/// One listener on one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. A slow subscriber gets
    /// [`BusError::Lagged`] once and then resumes with the oldest retained
    /// message.
    pub async fn recv(&mut self) -> BusResult<BusMessage> {
        match self.receiver.recv().await {
            Ok(message) => Ok(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
        }
    }

    pub fn try_recv(&mut self) -> BusResult<Option<BusMessage>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
        }
    }

    pub fn unsubscribe(self) {}
}

/// In-memory bus shared by the transport implementations.
#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Drops senders for topics that no longer have listeners.
    pub fn prune(&self) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        before - guard.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        let mut guard = self.topics.write();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            topic: topic.to_string(),
            receiver,
        }
    }

    fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let guard = self.topics.read();
        let Some(sender) = guard.get(topic) else {
            return 0;
        };
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("session:output");
        assert_eq!(
            bus.publish("session:output", Bytes::from_static(b"ping")),
            1
        );
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "session:output");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn publish_without_listeners_reaches_nobody() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish("connected", Bytes::new()), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = LocalBus::new();
        let first = bus.subscribe("connected");
        let second = bus.subscribe("connected");
        assert_eq!(bus.subscriber_count("connected"), 2);
        first.unsubscribe();
        assert_eq!(bus.subscriber_count("connected"), 1);
        drop(second);
        assert_eq!(bus.publish("connected", Bytes::new()), 0);
        assert_eq!(bus.prune(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag_then_resumes() {
        let bus = LocalBus::with_capacity(2);
        let mut sub = bus.subscribe("session:output");
        for byte in 0u8..4 {
            bus.publish("session:output", Bytes::from(vec![byte]));
        }
        assert_eq!(sub.recv().await, Err(BusError::Lagged(2)));
        let next = sub.recv().await.expect("resumes after lag");
        assert_eq!(next.payload, Bytes::from(vec![2u8]));
    }

    #[test]
    fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut output = bus.subscribe("session:output");
        let _status = bus.subscribe("session:status");
        bus.publish("session:status", Bytes::from_static(b"{}"));
        assert_eq!(output.try_recv(), Ok(None));
    }
}
