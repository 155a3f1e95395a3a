use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;

use roomcast_core::error::Result;

use super::{Broker, Subscription};

const TOPIC_CAPACITY: usize = 1024;

/// In-process broker: one broadcast channel per topic.
///
/// Lagging subscribers skip messages rather than stall publishers, which
/// matches the at-most-once contract of a real pub/sub broker.
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Drop the topic channel, ending every subscription stream on it
    /// (what a broker disconnect looks like to subscribers).
    pub fn disconnect(&self, topic: &str) {
        self.topics.remove(topic);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let owned_topic = topic.to_string();
        let messages = stream::unfold(rx, move |mut rx| {
            let topic = owned_topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(%topic, skipped, "memory broker subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(Subscription::new(topic, messages))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let delivered = self.topics.get(topic).map(|tx| tx.send(payload).is_ok());
        if delivered == Some(false) {
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("chat:c").await.unwrap();
        let mut b = broker.subscribe("chat:c").await.unwrap();
        assert_eq!(broker.subscriber_count("chat:c"), 2);

        broker.publish("chat:c", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn dropping_subscription_releases_topic() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("chat:c").await.unwrap();
        drop(sub);
        assert_eq!(broker.subscriber_count("chat:c"), 0);
        broker.publish("chat:c", Bytes::from_static(b"x")).await.unwrap();
        assert!(broker.topics.get("chat:c").is_none());
    }

    #[tokio::test]
    async fn disconnect_ends_stream() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("chat:c").await.unwrap();
        broker.disconnect("chat:c");
        assert!(sub.next().await.is_none());
    }
}
