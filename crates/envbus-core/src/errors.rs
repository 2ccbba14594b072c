use std::time::Duration;

/// Failures surfaced by a bus implementation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("bus error: {0}")]
    Backend(String),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Protocol(_) => "protocol",
            Self::Backend(_) => "backend",
        }
    }
}

/// Failures decoding protocol payloads.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid payload size: expected {expected} bytes, got {actual}")]
    InvalidPayloadSize { expected: usize, actual: usize },
    #[error("state message is too small ({actual} bytes, need at least {min})")]
    StateTooSmall { actual: usize, min: usize },
    #[error("observation size {obs_size} is outside 1..={max}")]
    ObsSizeOutOfRange { obs_size: usize, max: usize },
    #[error("invalid reward: {0:?}")]
    InvalidReward(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_is_timeout() {
        assert!(BusError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!BusError::Closed.is_timeout());
        assert!(!BusError::Backend("x".into()).is_timeout());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(BusError::Closed.error_kind(), "closed");
        assert_eq!(
            BusError::Connect {
                address: "a".into(),
                reason: "b".into()
            }
            .error_kind(),
            "connect"
        );
    }

    #[test]
    fn codec_display() {
        let err = CodecError::InvalidPayloadSize {
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.to_string(), "invalid payload size: expected 4 bytes, got 3");
    }
}
