//! Pub/sub broker seam.
//!
//! The broker, not the hub, is the cross-instance authority: every room
//! subscribes to `prefix + conversation_id` and anything published there is
//! fanned out to the sockets this process holds for that conversation.
//!
//! Backends:
//! - `MemoryBroker`: in-process broadcast channels (single instance, tests).
//! - `RedisBroker`: Redis PUBLISH/SUBSCRIBE.

mod bridge;
pub mod memory;
pub mod redis_pubsub;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use roomcast_core::error::Result;
use roomcast_core::protocol::topic::room_topic;
use roomcast_core::Envelope;

use crate::config::{BrokerBackend, BrokerSection};

pub(crate) use bridge::{run_bridge, BridgeSpec};
pub use memory::MemoryBroker;
pub use redis_pubsub::RedisBroker;

/// Confirmed subscription to one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    messages: BoxStream<'static, Bytes>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, messages: BoxStream<'static, Bytes>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next raw payload; `None` when the broker connection ended.
    pub async fn next(&mut self) -> Option<Bytes> {
        futures_util::StreamExt::next(&mut self.messages).await
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Resolves only after the broker confirmed the subscription, so nothing
    /// published afterwards can be missed.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Publish one envelope to its conversation's topic.
///
/// This is the entry point for producers without a socket (e.g. a REST
/// send-message path) as well as for republishing socket traffic.
pub async fn publish_envelope(broker: &dyn Broker, topic_prefix: &str, env: &Envelope) -> Result<()> {
    let topic = room_topic(topic_prefix, &env.conversation_id);
    let payload = Bytes::from(env.encode()?);
    broker.publish(&topic, payload).await
}

/// Build the configured backend.
pub async fn connect(cfg: &BrokerSection) -> Result<Arc<dyn Broker>> {
    match cfg.backend {
        BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
        BrokerBackend::Redis => {
            let url = cfg.url.as_deref().unwrap_or_default();
            Ok(Arc::new(RedisBroker::connect(url).await?))
        }
    }
}
