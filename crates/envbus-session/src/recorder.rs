use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use envbus_core::{BusConnection, BusMessage, BusSubscription, Connector};

use crate::error::{Op, SessionError};
use crate::master::{open_confirmed, TopicKind};

/// Dumps every frame published on a raw-screen channel to numbered files.
pub struct FrameRecorder {
    connection: Box<dyn BusConnection>,
    subscription: Box<dyn BusSubscription>,
    channel: String,
    out_dir: PathBuf,
    next_index: usize,
}

/// `<out_dir>/000042.png`
pub fn frame_path(out_dir: &Path, index: usize) -> PathBuf {
    out_dir.join(format!("{index:06}.png"))
}

impl FrameRecorder {
    /// Subscribe to `channel` exactly as given. The output directory is
    /// created when the first frame arrives.
    pub async fn establish(
        connector: &dyn Connector,
        address: &str,
        channel: &str,
        out_dir: impl Into<PathBuf>,
        subscribe_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let op = Op::Record;
        let mut connection = connector
            .connect(address)
            .await
            .map_err(|e| SessionError::bus(op, e))?;
        let subscription = match open_confirmed(
            connection.as_mut(),
            TopicKind::Exact,
            &[channel.to_string()],
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
        info!(%channel, "recording frames");
        Ok(Self {
            connection,
            subscription,
            channel: channel.to_string(),
            out_dir: out_dir.into(),
            next_index: 0,
        })
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> usize {
        self.next_index
    }

    /// Wait up to `timeout` for the next frame and write it out.
    /// Returns `None` if no frame arrived in time.
    pub async fn record_next(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<PathBuf>, SessionError> {
        let op = Op::Record;
        loop {
            let payload = match self.subscription.receive(timeout).await {
                Ok(BusMessage::Data { channel, payload }) if channel == self.channel => payload,
                Ok(other) => {
                    debug!(msg = ?other, "ignoring message");
                    continue;
                }
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(SessionError::bus(op, e)),
            };

            if self.next_index == 0 {
                tokio::fs::create_dir_all(&self.out_dir)
                    .await
                    .map_err(|source| SessionError::Io { op, source })?;
            }
            let path = frame_path(&self.out_dir, self.next_index);
            tokio::fs::write(&path, &payload)
                .await
                .map_err(|source| SessionError::Io { op, source })?;
            self.next_index += 1;
            debug!(path = %path.display(), len = payload.len(), "frame written");
            return Ok(Some(path));
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

    #[test]
    fn frame_paths_are_zero_padded() {
        let dir = Path::new("out");
        assert_eq!(frame_path(dir, 0), PathBuf::from("out/000000.png"));
        assert_eq!(frame_path(dir, 123_456), PathBuf::from("out/123456.png"));
    }
}
