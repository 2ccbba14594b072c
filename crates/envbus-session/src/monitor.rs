//! Watches the state traffic of every environment under a prefix.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use envbus_core::channels::env_id_from_channel;
use envbus_core::{BusConnection, BusMessage, BusSubscription, Channels, Connector, EnvId};

use crate::error::{Op, SessionError};
use crate::master::{open_confirmed, TopicKind};

/// Activity observed over one reporting interval.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityReport {
    pub env_ids: BTreeSet<EnvId>,
    pub transitions: usize,
    pub bytes: usize,
    pub elapsed: Duration,
    pub at: DateTime<Utc>,
}

impl ActivityReport {
    pub fn transitions_per_sec(&self) -> f64 {
        per_sec(self.transitions, self.elapsed)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        per_sec(self.bytes, self.elapsed)
    }
}

fn per_sec(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}

/// Accumulates state messages until an interval has passed.
#[derive(Debug)]
pub struct ActivityWindow {
    interval: Duration,
    started: Instant,
    env_ids: BTreeSet<EnvId>,
    transitions: usize,
    bytes: usize,
}

impl ActivityWindow {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            started: now,
            env_ids: BTreeSet::new(),
            transitions: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, env_id: EnvId, len: usize) {
        self.env_ids.insert(env_id);
        self.transitions += 1;
        self.bytes += len;
    }

    /// Close the window if the interval has elapsed, starting a new one.
    pub fn flush_if_due(&mut self, now: Instant) -> Option<ActivityReport> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.interval {
            return None;
        }
        let report = ActivityReport {
            env_ids: std::mem::take(&mut self.env_ids),
            transitions: std::mem::take(&mut self.transitions),
            bytes: std::mem::take(&mut self.bytes),
            elapsed,
            at: Utc::now(),
        };
        self.started = now;
        Some(report)
    }
}

/// Subscribes to every state channel and reports throughput per interval.
pub struct StateMonitor {
    connection: Box<dyn BusConnection>,
    subscription: Box<dyn BusSubscription>,
    window: ActivityWindow,
    interval: Duration,
}

impl StateMonitor {
    pub async fn establish(
        connector: &dyn Connector,
        address: &str,
        channel_prefix: &str,
        subscribe_timeout: Duration,
        interval: Duration,
    ) -> Result<Self, SessionError> {
        let op = Op::Watch;
        if interval.is_zero() {
            return Err(SessionError::ZeroInterval { op });
        }
        let mut connection = connector
            .connect(address)
            .await
            .map_err(|e| SessionError::bus(op, e))?;
        let pattern = Channels::new(channel_prefix).state_pattern();
        let subscription = match open_confirmed(
            connection.as_mut(),
            TopicKind::Pattern,
            &[pattern],
            subscribe_timeout,
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = connection.close().await;
                return Err(SessionError::bus(op, e));
            }
        };
        Ok(Self {
            connection,
            subscription,
            window: ActivityWindow::new(interval, Instant::now()),
            interval,
        })
    }

    /// Wait for the next report. A report is emitted when a state message
    /// arrives after the interval has elapsed; idle periods produce none.
    pub async fn next_report(&mut self) -> Result<ActivityReport, SessionError> {
        loop {
            match self.subscription.receive(self.interval).await {
                Ok(BusMessage::Data { channel, payload }) => {
                    if let Some(env_id) = env_id_from_channel(&channel) {
                        self.window.record(env_id, payload.len());
                    }
                    if let Some(report) = self.window.flush_if_due(Instant::now()) {
                        return Ok(report);
                    }
                }
                Ok(other) => debug!(msg = ?other, "ignoring message"),
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(SessionError::bus(Op::Watch, e)),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), SessionError> {
        let _ = self.subscription.close().await;
        self.connection
            .close()
            .await
            .map_err(|e| SessionError::bus(Op::Close, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_reports_after_interval() {
        let start = Instant::now();
        let mut window = ActivityWindow::new(Duration::from_secs(2), start);
        window.record(EnvId::from_raw("a"), 10);
        window.record(EnvId::from_raw("b"), 30);
        window.record(EnvId::from_raw("a"), 20);
        assert!(window.flush_if_due(start + Duration::from_secs(1)).is_none());

        let report = window.flush_if_due(start + Duration::from_secs(2)).unwrap();
        assert_eq!(report.env_ids.len(), 2);
        assert_eq!(report.transitions, 3);
        assert_eq!(report.bytes, 60);
        assert_eq!(report.transitions_per_sec(), 1.5);
        assert_eq!(report.bytes_per_sec(), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_flush() {
        let start = Instant::now();
        let mut window = ActivityWindow::new(Duration::from_secs(1), start);
        window.record(EnvId::from_raw("a"), 1);
        let _ = window.flush_if_due(start + Duration::from_secs(1)).unwrap();
        let report = window.flush_if_due(start + Duration::from_secs(2)).unwrap();
        assert!(report.env_ids.is_empty());
        assert_eq!(report.transitions, 0);
        assert_eq!(report.elapsed, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let bus = envbus_core::MemoryBus::new();
        let err = StateMonitor::establish(
            &bus,
            "memory",
            "p",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::ZeroInterval { op: Op::Watch }));
        assert_eq!(bus.open_connections(), 0);
    }

    #[test]
    fn zero_elapsed_rates_are_zero() {
        assert_eq!(per_sec(5, Duration::ZERO), 0.0);
    }
}
