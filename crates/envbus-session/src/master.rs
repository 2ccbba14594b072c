//! Master side of the protocol: collects state from every worker sharing a
//! channel prefix and sends actions back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use envbus_core::channels::env_id_from_channel;
use envbus_core::state::DEFAULT_OBS_SIZE;
use envbus_core::{
    Action, BusConnection, BusError, BusMessage, BusSubscription, Channels, Connector, EnvId,
    StateFrame,
};

use crate::error::{Op, SessionError};
use crate::session::SUBSCRIBE_TIMEOUT;

/// Payload announced on the master-ready channel.
pub const READY_PAYLOAD: &[u8] = b"ready";

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub subscribe_timeout: Duration,
    pub obs_size: usize,
    /// Wait per receive in the background reader; bounds shutdown latency.
    pub poll_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            obs_size: DEFAULT_OBS_SIZE,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// One decoded state message.
#[derive(Clone, Debug)]
pub struct StateUpdate {
    pub env_id: EnvId,
    pub frame: StateFrame,
    pub received_at: DateTime<Utc>,
}

impl StateUpdate {
    /// Whether this is the first timestep of a new episode.
    pub fn is_new_episode(&self) -> bool {
        self.frame.done
    }
}

#[derive(Default)]
struct Pending {
    updates: Vec<StateUpdate>,
    error: Option<BusError>,
}

/// Reads states from, and sends actions to, remote workers.
pub struct MasterConn {
    connection: Box<dyn BusConnection>,
    channels: Channels,
    pending: Arc<Mutex<Pending>>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl MasterConn {
    /// Subscribe to every worker's state channel, then announce on the
    /// master-ready channel so workers drop actions from any previous master.
    pub async fn establish(
        connector: &dyn Connector,
        address: &str,
        channel_prefix: &str,
        config: &MasterConfig,
    ) -> Result<Self, SessionError> {
        let op = Op::Establish;
        StateFrame::pixel_len(config.obs_size)
            .map_err(|source| SessionError::Codec { op, source })?;
        let channels = Channels::new(channel_prefix);
        let mut connection = connector
            .connect(address)
            .await
            .map_err(|e| SessionError::bus(op, e))?;

        if let Err(e) = connection.ping().await {
            let _ = connection.close().await;
            return Err(SessionError::bus(op, e));
        }

        let mut subscription = match open_confirmed(
            connection.as_mut(),
            TopicKind::Pattern,
            &[channels.state_pattern()],
            config.subscribe_timeout,
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = connection.close().await;
                return Err(SessionError::bus(op, e));
            }
        };

        if let Err(e) = connection
            .publish(&channels.master_ready(), READY_PAYLOAD)
            .await
        {
            let _ = subscription.close().await;
            let _ = connection.close().await;
            return Err(SessionError::bus(op, e));
        }
        info!(prefix = channel_prefix, "master ready");

        let pending = Arc::new(Mutex::new(Pending::default()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(
            subscription,
            Arc::clone(&pending),
            shutdown_rx,
            config.obs_size,
            config.poll_interval,
        ));

        Ok(Self {
            connection,
            channels,
            pending,
            shutdown: Some(shutdown_tx),
            reader: Some(reader),
        })
    }

    /// Take every state received since the last call.
    ///
    /// Fails with the bus error that stopped the background reader, if any.
    pub fn read_states(&self) -> Result<Vec<StateUpdate>, SessionError> {
        let mut pending = self.pending.lock();
        if let Some(e) = &pending.error {
            return Err(SessionError::bus(Op::ReadStates, e.clone()));
        }
        Ok(std::mem::take(&mut pending.updates))
    }

    /// Send one action to each listed environment.
    pub async fn send_actions(&mut self, actions: &[(EnvId, Action)]) -> Result<(), SessionError> {
        for (env_id, action) in actions {
            let channel = self.channels.act(env_id);
            debug!(%env_id, %action, %channel, "sending action");
            self.connection
                .publish(&channel, &action.encode())
                .await
                .map_err(|e| SessionError::bus(Op::SendActions, e))?;
        }
        Ok(())
    }

    /// Stop the reader (releasing its subscription) and close the connection.
    pub async fn close(mut self) -> Result<(), SessionError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!(error = %e, "state reader task failed");
            }
        }
        self.connection
            .close()
            .await
            .map_err(|e| SessionError::bus(Op::Close, e))
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum TopicKind {
    Exact,
    Pattern,
}

/// Subscribe and wait for confirmation, releasing the subscription on failure.
pub(crate) async fn open_confirmed(
    connection: &mut dyn BusConnection,
    kind: TopicKind,
    topics: &[String],
    timeout: Duration,
) -> Result<Box<dyn BusSubscription>, BusError> {
    let mut subscription = match kind {
        TopicKind::Exact => connection.subscribe(topics).await?,
        TopicKind::Pattern => connection.psubscribe(topics).await?,
    };
    if let Err(e) = subscription.confirm(timeout).await {
        let _ = subscription.close().await;
        return Err(e);
    }
    Ok(subscription)
}

async fn read_loop(
    mut subscription: Box<dyn BusSubscription>,
    pending: Arc<Mutex<Pending>>,
    mut shutdown: oneshot::Receiver<()>,
    obs_size: usize,
    poll_interval: Duration,
) {
    loop {
        let received = tokio::select! {
            _ = &mut shutdown => break,
            received = subscription.receive(poll_interval) => received,
        };
        match received {
            Ok(BusMessage::Data { channel, payload }) => {
                if let Some(update) = decode_update(&channel, &payload, obs_size) {
                    pending.lock().updates.push(update);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                warn!(error = %e, "state reader stopped");
                pending.lock().error = Some(e);
                break;
            }
        }
    }
    if let Err(e) = subscription.close().await {
        debug!(error = %e, "state subscription release failed");
    }
}

fn decode_update(channel: &str, payload: &[u8], obs_size: usize) -> Option<StateUpdate> {
    let Some(env_id) = env_id_from_channel(channel) else {
        warn!(%channel, "state message on unexpected channel");
        return None;
    };
    match StateFrame::decode(payload, obs_size) {
        Ok(frame) => {
            debug!(%env_id, reward = frame.reward, done = frame.done, "state received");
            Some(StateUpdate {
                env_id,
                frame,
                received_at: Utc::now(),
            })
        }
        Err(e) => {
            warn!(%env_id, error = %e, "dropping state message");
            None
        }
    }
}
