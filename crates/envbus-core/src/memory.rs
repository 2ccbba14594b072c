//! In-process bus used by tests and local demos.
//!
//! Delivers published payloads to every live subscription whose channel or
//! glob pattern matches, and records what happened so tests can assert on
//! publish traffic and release ordering. Faults can be switched on to
//! exercise failure paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bus::{BusConnection, BusMessage, BusSubscription, Connector};
use crate::errors::BusError;

/// Switches for failure injection.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    pub refuse_connect: bool,
    pub fail_ping: bool,
    /// Subscriptions never get confirmed; `confirm` waits out its timeout.
    pub withhold_confirm: bool,
    pub fail_confirm: bool,
    pub fail_publish: bool,
    pub fail_close: bool,
}

/// Lifecycle record kept by the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    Connected { conn: u64 },
    Subscribed { sub: u64, topics: Vec<String> },
    SubscriptionClosed { sub: u64 },
    ConnectionClosed { conn: u64 },
}

enum Topic {
    Channel(String),
    Pattern(glob::Pattern),
}

impl Topic {
    fn matches(&self, channel: &str) -> bool {
        match self {
            Topic::Channel(c) => c == channel,
            Topic::Pattern(p) => p.matches(channel),
        }
    }
}

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Hub {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    open_connections: AtomicU64,
    published: Mutex<Vec<(String, Bytes)>>,
    events: Mutex<Vec<BusEvent>>,
    faults: Mutex<Faults>,
}

impl Hub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, event: BusEvent) {
        self.events.lock().push(event);
    }

    fn faults(&self) -> Faults {
        self.faults.lock().clone()
    }

    fn deliver(&self, channel: &str, message: &BusMessage) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            let wanted = sub.topics.iter().any(|t| t.matches(channel));
            if wanted && sub.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Cheaply cloneable handle to one in-process bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    hub: Arc<Hub>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.hub.faults.lock() = faults;
    }

    /// Publish from outside any connection, as a remote peer would.
    /// Returns the number of subscriptions that received it.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        self.hub
            .published
            .lock()
            .push((channel.to_string(), payload.clone()));
        let message = BusMessage::Data {
            channel: channel.to_string(),
            payload,
        };
        self.hub.deliver(channel, &message)
    }

    /// Push an arbitrary message shape to subscribers of `channel`.
    pub fn inject(&self, channel: &str, message: BusMessage) -> usize {
        self.hub.deliver(channel, &message)
    }

    /// Drop every subscription's delivery queue, as a lost server would.
    pub fn disconnect_subscribers(&self) {
        self.hub.subscribers.clear();
    }

    /// Every payload published so far, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.hub.published.lock().clone()
    }

    /// Payloads published on one channel.
    pub fn published_on(&self, channel: &str) -> Vec<Bytes> {
        self.hub
            .published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.hub.events.lock().clone()
    }

    pub fn open_connections(&self) -> u64 {
        self.hub.open_connections.load(Ordering::Relaxed)
    }

    pub fn open_subscriptions(&self) -> usize {
        self.hub.subscribers.len()
    }

    /// Channels and patterns of every live subscription.
    pub fn subscribed_topics(&self) -> Vec<Vec<String>> {
        self.hub
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BusEvent::Subscribed { sub, topics } if self.hub.subscribers.contains_key(sub) => {
                    Some(topics.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn connect(&self, address: &str) -> Result<Box<dyn BusConnection>, BusError> {
        if self.hub.faults().refuse_connect {
            return Err(BusError::Connect {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        let id = self.hub.next_id();
        self.hub.open_connections.fetch_add(1, Ordering::Relaxed);
        self.hub.record(BusEvent::Connected { conn: id });
        Ok(Box::new(MemoryConnection {
            id,
            bus: self.clone(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    bus: MemoryBus,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn register(&self, names: &[String], topics: Vec<Topic>) -> Box<dyn BusSubscription> {
        let hub = &self.bus.hub;
        let id = hub.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribers.insert(id, Subscriber { topics, tx });
        hub.record(BusEvent::Subscribed {
            sub: id,
            topics: names.to_vec(),
        });
        Box::new(MemorySubscription {
            id,
            bus: self.bus.clone(),
            rx,
            closed: false,
        })
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<(), BusError> {
        self.ensure_open()?;
        if self.bus.hub.faults().fail_ping {
            return Err(BusError::Backend("ping refused".into()));
        }
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        self.ensure_open()?;
        if self.bus.hub.faults().fail_publish {
            return Err(BusError::Backend("publish refused".into()));
        }
        self.bus.publish(channel, Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn subscribe(
        &mut self,
        channels: &[String],
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        self.ensure_open()?;
        let topics = channels.iter().cloned().map(Topic::Channel).collect();
        Ok(self.register(channels, topics))
    }

    async fn psubscribe(
        &mut self,
        patterns: &[String],
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        self.ensure_open()?;
        let topics = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map(Topic::Pattern)
                    .map_err(|e| BusError::Protocol(format!("bad pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.register(patterns, topics))
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.closed = true;
        self.bus.hub.open_connections.fetch_sub(1, Ordering::Relaxed);
        self.bus.hub.record(BusEvent::ConnectionClosed { conn: self.id });
        if self.bus.hub.faults().fail_close {
            return Err(BusError::Backend("close failed".into()));
        }
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    bus: MemoryBus,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    closed: bool,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn confirm(&mut self, timeout: Duration) -> Result<(), BusError> {
        let faults = self.bus.hub.faults();
        if faults.fail_confirm {
            return Err(BusError::Backend("subscribe rejected".into()));
        }
        if faults.withhold_confirm {
            tokio::time::sleep(timeout).await;
            return Err(BusError::Timeout(timeout));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<BusMessage, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.closed = true;
        let _ = self.bus.hub.subscribers.remove(&self.id);
        self.bus.hub.record(BusEvent::SubscriptionClosed { sub: self.id });
        Ok(())
    }
}
