//! Redis pub/sub backend for the envbus traits.
//!
//! Publishing goes through a multiplexed connection; every subscription
//! opens its own dedicated pub/sub connection, as Redis requires.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use tracing::{debug, warn};

use envbus_core::{BusConnection, BusError, BusMessage, BusSubscription, Connector};

/// Opens Redis connections. Addresses may be bare `host:port` or full
/// `redis://` URLs.
#[derive(Clone, Debug, Default)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn BusConnection>, BusError> {
        let url = normalize_address(address);
        let connect_err = |e: redis::RedisError| BusError::Connect {
            address: url.clone(),
            reason: e.to_string(),
        };
        let client = redis::Client::open(url.as_str()).map_err(connect_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_err)?;
        debug!(address = %url, "redis connection opened");
        Ok(Box::new(RedisConnection {
            client,
            conn: Some(conn),
        }))
    }
}

/// Turn `host:port` into a `redis://` URL; URLs pass through.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}

fn bus_error(e: redis::RedisError) -> BusError {
    if e.is_connection_dropped() || e.is_connection_refusal() {
        BusError::Closed
    } else {
        BusError::Backend(e.to_string())
    }
}

struct RedisConnection {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
}

impl RedisConnection {
    fn conn(&mut self) -> Result<&mut MultiplexedConnection, BusError> {
        self.conn.as_mut().ok_or(BusError::Closed)
    }

    async fn open_subscription(
        &mut self,
        topics: Vec<Topic>,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        self.conn()?;
        let pubsub = self.client.get_async_pubsub().await.map_err(bus_error)?;
        Ok(Box::new(RedisSubscription {
            pubsub: Some(pubsub),
            topics,
        }))
    }
}

#[async_trait]
impl BusConnection for RedisConnection {
    async fn ping(&mut self) -> Result<(), BusError> {
        let conn = self.conn()?;
        let pong: String = redis::cmd("PING").query_async(conn).await.map_err(bus_error)?;
        if pong != "PONG" {
            return Err(BusError::Protocol(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let conn = self.conn()?;
        let _receivers: i64 = conn.publish(channel, payload).await.map_err(bus_error)?;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        channels: &[String],
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let topics = channels.iter().cloned().map(Topic::Channel).collect();
        self.open_subscription(topics).await
    }

    async fn psubscribe(
        &mut self,
        patterns: &[String],
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let topics = patterns.iter().cloned().map(Topic::Pattern).collect();
        self.open_subscription(topics).await
    }

    async fn close(&mut self) -> Result<(), BusError> {
        // Multiplexed connections shut down once the last handle drops.
        self.conn.take().map(drop).ok_or(BusError::Closed)
    }
}

enum Topic {
    Channel(String),
    Pattern(String),
}

struct RedisSubscription {
    pubsub: Option<PubSub>,
    topics: Vec<Topic>,
}

impl RedisSubscription {
    fn pubsub(&mut self) -> Result<&mut PubSub, BusError> {
        self.pubsub.as_mut().ok_or(BusError::Closed)
    }
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn confirm(&mut self, timeout: Duration) -> Result<(), BusError> {
        let pubsub = self.pubsub.as_mut().ok_or(BusError::Closed)?;
        let topics = &self.topics;
        let handshake = async {
            // Each call resolves once Redis acknowledges the subscription.
            for topic in topics {
                match topic {
                    Topic::Channel(c) => pubsub.subscribe(c).await?,
                    Topic::Pattern(p) => pubsub.psubscribe(p).await?,
                }
            }
            Ok::<_, redis::RedisError>(())
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result.map_err(bus_error),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<BusMessage, BusError> {
        let pubsub = self.pubsub()?;
        let mut stream = pin!(pubsub.on_message());
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(msg)) => Ok(BusMessage::Data {
                channel: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            }),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    async fn close(&mut self) -> Result<(), BusError> {
        let mut pubsub = self.pubsub.take().ok_or(BusError::Closed)?;
        let mut result = Ok(());
        for topic in &self.topics {
            let outcome = match topic {
                Topic::Channel(c) => pubsub.unsubscribe(c).await,
                Topic::Pattern(p) => pubsub.punsubscribe(p).await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "unsubscribe failed");
                if result.is_ok() {
                    result = Err(bus_error(e));
                }
            }
        }
        result
    }
}
