//! Worker side of the protocol: one environment served to remote masters.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use envbus_core::{Action, BusConnection, BusMessage, BusSubscription, Channels, Connector, EnvId};

use crate::error::{Op, SessionError};

/// How long establishment waits for the bus to confirm the subscription.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one `receive_act` call, measured from call entry.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub subscribe_timeout: Duration,
    pub action_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            action_timeout: ACTION_TIMEOUT,
        }
    }
}

/// Outcome of a successful [`Session::receive_act`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    Action(Action),
    /// A master announced itself; the current action stream is stale.
    NewMaster,
}

impl Received {
    pub fn action(self) -> Option<Action> {
        match self {
            Self::Action(a) => Some(a),
            Self::NewMaster => None,
        }
    }
}

/// Serves a single environment to remote masters.
///
/// Owns one connection and one subscription (the action channel plus the
/// shared master-ready broadcast), both released by [`Session::close`].
pub struct Session {
    connection: Box<dyn BusConnection>,
    subscription: Box<dyn BusSubscription>,
    env_id: EnvId,
    act_channel: String,
    state_channel: String,
    master_ready_channel: String,
    action_timeout: Duration,
}

impl Session {
    /// Establish a session with an id drawn from the thread-local generator.
    pub async fn connect(
        connector: &dyn Connector,
        address: &str,
        channel_prefix: &str,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let env_id = EnvId::generate(&mut rand::thread_rng());
        Self::establish_with_id(connector, address, channel_prefix, env_id, config).await
    }

    /// Establish a session with an id drawn from `rng`.
    pub async fn establish<R: Rng + ?Sized>(
        connector: &dyn Connector,
        address: &str,
        channel_prefix: &str,
        config: &SessionConfig,
        rng: &mut R,
    ) -> Result<Self, SessionError> {
        let env_id = EnvId::generate(rng);
        Self::establish_with_id(connector, address, channel_prefix, env_id, config).await
    }

    /// Connect, health-check, subscribe and wait for the subscription to be
    /// confirmed. Once this returns, every action or master-ready message
    /// published afterwards is observed. On any failure nothing is left open.
    pub async fn establish_with_id(
        connector: &dyn Connector,
        address: &str,
        channel_prefix: &str,
        env_id: EnvId,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let op = Op::Establish;
        let mut connection = connector
            .connect(address)
            .await
            .map_err(|e| SessionError::bus(op, e))?;

        if let Err(e) = connection.ping().await {
            let _ = connection.close().await;
            return Err(SessionError::bus(op, e));
        }

        let channels = Channels::new(channel_prefix);
        let act_channel = channels.act(&env_id);
        let master_ready_channel = channels.master_ready();

        let mut subscription = match connection
            .subscribe(&[act_channel.clone(), master_ready_channel.clone()])
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = connection.close().await;
                return Err(SessionError::bus(op, e));
            }
        };

        if let Err(e) = subscription.confirm(config.subscribe_timeout).await {
            warn!(env_id = %env_id, error = %e, "subscription handshake failed");
            let _ = subscription.close().await;
            let _ = connection.close().await;
            return Err(SessionError::bus(op, e));
        }

        info!(env_id = %env_id, prefix = channel_prefix, "session established");
        Ok(Self {
            connection,
            subscription,
            state_channel: channels.state(&env_id),
            env_id,
            act_channel,
            master_ready_channel,
            action_timeout: config.action_timeout,
        })
    }

    pub fn env_id(&self) -> &EnvId {
        &self.env_id
    }

    /// Publish an environment state update. Fire-and-forget.
    pub async fn send_state(&mut self, state: &[u8]) -> Result<(), SessionError> {
        trace!(env_id = %self.env_id, len = state.len(), "sending state");
        self.connection
            .publish(&self.state_channel, state)
            .await
            .map_err(|e| SessionError::bus(Op::SendState, e))
    }

    /// Wait for the next action from a master.
    ///
    /// The action timeout is an absolute cap from call entry: each inner
    /// receive only gets what is left of it. Messages on unexpected channels
    /// or of other shapes are skipped.
    pub async fn receive_act(&mut self) -> Result<Received, SessionError> {
        let op = Op::ReceiveAct;
        let deadline = Instant::now() + self.action_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ActionTimeout {
                    op,
                    timeout: self.action_timeout,
                });
            }

            let message = match self.subscription.receive(remaining).await {
                Ok(message) => message,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(SessionError::bus(op, e)),
            };

            match message {
                BusMessage::Data { channel, .. } if channel == self.master_ready_channel => {
                    info!(env_id = %self.env_id, "master changed");
                    return Ok(Received::NewMaster);
                }
                BusMessage::Data { channel, payload } if channel == self.act_channel => {
                    let action = Action::decode(&payload).map_err(|_| {
                        SessionError::InvalidPayloadSize {
                            op,
                            len: payload.len(),
                        }
                    })?;
                    trace!(env_id = %self.env_id, %action, "received action");
                    return Ok(Received::Action(action));
                }
                other => {
                    debug!(env_id = %self.env_id, msg = ?other, "ignoring message");
                }
            }
        }
    }

    /// Publish raw bytes (e.g. an encoded video frame) to `channel` verbatim.
    pub async fn send_raw_screen(
        &mut self,
        channel: &str,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.connection
            .publish(channel, data)
            .await
            .map_err(|e| SessionError::bus(Op::SendRawScreen, e))
    }

    /// Release the subscription, then the connection. Only the connection
    /// release error is reported.
    pub async fn close(mut self) -> Result<(), SessionError> {
        if let Err(e) = self.subscription.close().await {
            debug!(env_id = %self.env_id, error = %e, "subscription release failed");
        }
        self.connection
            .close()
            .await
            .map_err(|e| SessionError::bus(Op::Close, e))?;
        info!(env_id = %self.env_id, "session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envbus_core::memory::{BusEvent, Faults};
    use envbus_core::MemoryBus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn session(bus: &MemoryBus) -> Session {
        Session::establish_with_id(
            bus,
            "memory",
            "p",
            EnvId::from_raw("abc123abc123"),
            &SessionConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn subscribes_to_action_and_master_ready() {
        let bus = MemoryBus::new();
        let _session = session(&bus).await;
        assert_eq!(
            bus.subscribed_topics(),
            vec![vec![
                "p:act:abc123abc123".to_string(),
                "p:master-ready".to_string()
            ]]
        );
    }

    #[tokio::test]
    async fn injected_rng_decides_env_id() {
        let bus = MemoryBus::new();
        let a = Session::establish(
            &bus,
            "memory",
            "p",
            &SessionConfig::default(),
            &mut StdRng::seed_from_u64(3),
        )
        .await
        .unwrap();
        let expected = EnvId::generate(&mut StdRng::seed_from_u64(3));
        assert_eq!(a.env_id(), &expected);
    }

    #[tokio::test]
    async fn decodes_actions() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        bus.publish("p:act:abc123abc123", "1001");
        let got = s.receive_act().await.unwrap();
        assert_eq!(got, Received::Action(Action::from([true, false, false, true])));
    }

    #[tokio::test]
    async fn master_ready_is_new_master() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        bus.publish("p:master-ready", "ready");
        bus.publish("p:act:abc123abc123", "1111");
        assert_eq!(s.receive_act().await.unwrap(), Received::NewMaster);
        // The queued action is still delivered to the next call.
        assert!(s.receive_act().await.unwrap().action().is_some());
    }

    #[tokio::test]
    async fn wrong_size_fails_immediately() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        bus.publish("p:act:abc123abc123", "10");
        let err = s.receive_act().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidPayloadSize {
                op: Op::ReceiveAct,
                len: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_action_timeout() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        let start = Instant::now();
        let err = s.receive_act().await.unwrap_err();
        assert!(matches!(err, SessionError::ActionTimeout { .. }));
        assert!(start.elapsed() >= ACTION_TIMEOUT);
    }

    #[tokio::test]
    async fn publish_paths() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        s.send_state(b"state").await.unwrap();
        s.send_raw_screen("recorder:frames", b"png").await.unwrap();
        assert_eq!(bus.published_on("p:state:abc123abc123"), vec!["state"]);
        assert_eq!(bus.published_on("recorder:frames"), vec!["png"]);
    }

    #[tokio::test]
    async fn publish_failure_is_annotated() {
        let bus = MemoryBus::new();
        let mut s = session(&bus).await;
        bus.set_faults(Faults {
            fail_publish: true,
            ..Faults::default()
        });
        let err = s.send_state(b"x").await.unwrap_err();
        assert_eq!(err.op(), Op::SendState);
        let err = s.send_raw_screen("c", b"x").await.unwrap_err();
        assert_eq!(err.op(), Op::SendRawScreen);
    }

    #[tokio::test]
    async fn close_releases_subscription_first() {
        let bus = MemoryBus::new();
        let s = session(&bus).await;
        s.close().await.unwrap();
        let events = bus.events();
        let sub_closed = events
            .iter()
            .position(|e| matches!(e, BusEvent::SubscriptionClosed { .. }))
            .unwrap();
        let conn_closed = events
            .iter()
            .position(|e| matches!(e, BusEvent::ConnectionClosed { .. }))
            .unwrap();
        assert!(sub_closed < conn_closed);
        assert_eq!(bus.open_connections(), 0);
        assert_eq!(bus.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn close_reports_connection_error() {
        let bus = MemoryBus::new();
        let s = session(&bus).await;
        bus.set_faults(Faults {
            fail_close: true,
            ..Faults::default()
        });
        let err = s.close().await.unwrap_err();
        assert_eq!(err.op(), Op::Close);
    }
}
