use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::BusError;

/// One item delivered on a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusMessage {
    /// A published payload. `channel` is the concrete channel it was
    /// published on, also for pattern subscriptions.
    Data { channel: String, payload: Bytes },
    /// Subscription confirmation from the bus.
    Subscribed { channel: String },
    /// Any other control message the backend surfaces.
    Other,
}

/// Opens connections to a bus at an address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn BusConnection>, BusError>;
}

/// An exclusively owned connection. Not safe for concurrent use; callers
/// serialize access through `&mut self`.
#[async_trait]
pub trait BusConnection: Send {
    /// Round-trip liveness check.
    async fn ping(&mut self) -> Result<(), BusError>;

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Start subscribing to exact channel names. The returned subscription
    /// is only guaranteed to observe messages after [`BusSubscription::confirm`].
    async fn subscribe(
        &mut self,
        channels: &[String],
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Start subscribing to glob patterns (`*` matches any run of characters).
    async fn psubscribe(&mut self, patterns: &[String])
        -> Result<Box<dyn BusSubscription>, BusError>;

    /// Release the connection. Further calls fail with [`BusError::Closed`].
    async fn close(&mut self) -> Result<(), BusError>;
}

/// A set of channel subscriptions fixed at creation.
#[async_trait]
pub trait BusSubscription: Send {
    /// Wait until the bus has acknowledged every channel, or `timeout` elapses.
    async fn confirm(&mut self, timeout: Duration) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next message. Elapsing yields
    /// [`BusError::Timeout`].
    async fn receive(&mut self, timeout: Duration) -> Result<BusMessage, BusError>;

    async fn close(&mut self) -> Result<(), BusError>;
}
