//! Redis pub/sub backend.
//!
//! Each room subscription owns a dedicated pub/sub connection (a connection
//! in subscriber mode cannot issue other commands). Publishing goes through
//! one multiplexed connection, which is cheap to clone per call.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use roomcast_core::error::{Result, RoomcastError};

use super::{Broker, Subscription};

pub struct RedisBroker {
    client: Client,
    publisher: MultiplexedConnection,
}

impl RedisBroker {
    /// Open the client and the shared publishing connection.
    ///
    /// The URL is never logged; it may carry credentials.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            tracing::error!(error = %e, "failed to open redis client");
            RoomcastError::Broker(format!("open redis client: {e}"))
        })?;

        let publisher = client.get_multiplexed_async_connection().await.map_err(|e| {
            tracing::error!(error = %e, "failed to connect to redis");
            RoomcastError::Broker(format!("connect to redis: {e}"))
        })?;

        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RoomcastError::Broker(format!("open pubsub connection: {e}")))?;

        // SUBSCRIBE returns after the server acknowledged the channel.
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| RoomcastError::Broker(format!("subscribe {topic}: {e}")))?;

        let messages = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()))
            .boxed();

        Ok(Subscription::new(topic, messages))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(topic, &payload[..])
            .await
            .map_err(|e| RoomcastError::Broker(format!("publish {topic}: {e}")))?;
        Ok(())
    }
}
