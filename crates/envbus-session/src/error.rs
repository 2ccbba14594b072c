use std::fmt;
use std::time::Duration;

use envbus_core::{BusError, CodecError};

/// The operation an error came from; prefixed onto every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Establish,
    SendState,
    ReceiveAct,
    SendRawScreen,
    Close,
    ReadStates,
    SendActions,
    Watch,
    Record,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Establish => "establish",
            Self::SendState => "send_state",
            Self::ReceiveAct => "receive_act",
            Self::SendRawScreen => "send_raw_screen",
            Self::Close => "close",
            Self::ReadStates => "read_states",
            Self::SendActions => "send_actions",
            Self::Watch => "watch",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{op}: {source}")]
    Bus {
        op: Op,
        #[source]
        source: BusError,
    },

    #[error("{op}: invalid payload size: expected 4 bytes, got {len}")]
    InvalidPayloadSize { op: Op, len: usize },

    #[error("{op}: action timeout exceeded after {timeout:?}")]
    ActionTimeout { op: Op, timeout: Duration },

    #[error("{op}: {source}")]
    Codec {
        op: Op,
        #[source]
        source: CodecError,
    },

    #[error("{op}: report interval must be positive")]
    ZeroInterval { op: Op },

    #[error("{op}: {source}")]
    Io {
        op: Op,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn bus(op: Op, source: BusError) -> Self {
        Self::Bus { op, source }
    }

    pub fn op(&self) -> Op {
        match self {
            Self::Bus { op, .. }
            | Self::InvalidPayloadSize { op, .. }
            | Self::ActionTimeout { op, .. }
            | Self::Codec { op, .. }
            | Self::ZeroInterval { op }
            | Self::Io { op, .. } => *op,
        }
    }

    /// The bus failure underneath, if any.
    pub fn bus_error(&self) -> Option<&BusError> {
        match self {
            Self::Bus { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bus { source, .. } => source.error_kind(),
            Self::InvalidPayloadSize { .. } => "invalid_payload_size",
            Self::ActionTimeout { .. } => "action_timeout",
            Self::Codec { .. } => "codec",
            Self::ZeroInterval { .. } => "zero_interval",
            Self::Io { .. } => "io",
        }
    }
}
