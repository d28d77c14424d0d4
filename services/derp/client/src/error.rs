//! Error taxonomy for relay clients.

use derp_wire::WireError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Coarse classification of a [`RelayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame or version mismatch; fatal to the connection
    Protocol,
    /// Underlying I/O failure; fatal to the connection
    Transport,
    /// Identity or mesh credential rejected
    Auth,
    /// Frame or packet over the limit; fatal to the call only
    Size,
    /// Client was closed
    Closed,
    /// Operation hit a superseded or missing connection
    Stale,
    /// Deadline or cancellation fired
    Timeout,
    /// Invalid configuration
    Config,
}

/// Relay client errors.
///
/// `Clone` so that one connect outcome can be handed to every caller that
/// joined the same attempt.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Malformed frame from the relay
    #[error("protocol error: {0}")]
    Protocol(WireError),

    /// Relay speaks a different protocol version
    #[error("protocol version mismatch: ours {ours}, relay {theirs}")]
    ProtocolMismatch {
        /// Version we speak
        ours: u32,
        /// Version the relay answered with
        theirs: u32,
    },

    /// Underlying stream failed
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// Relay rejected our identity or mesh key
    #[error("relay rejected client: {0}")]
    Auth(String),

    /// Packet data over the packet limit
    #[error("packet too large: {len} bytes (max {max})")]
    PacketTooLarge {
        /// Offending length
        len: usize,
        /// Limit in force
        max: usize,
    },

    /// Frame over the frame limit
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Offending length
        len: usize,
        /// Limit in force
        max: usize,
    },

    /// Connection was invalidated or superseded
    #[error("connection (generation {generation}) is closed")]
    ConnectionClosed {
        /// Generation of the dead connection
        generation: u64,
    },

    /// No connection has been established
    #[error("not connected")]
    NotConnected,

    /// Client was closed
    #[error("client closed")]
    Closed,

    /// Deadline passed
    #[error("timed out")]
    Timeout,

    /// Caller cancelled the operation
    #[error("cancelled")]
    Cancelled,

    /// Relay URL could not be parsed
    #[error("invalid relay url {url:?}: {reason}")]
    InvalidUrl {
        /// URL as given
        url: String,
        /// What is wrong with it
        reason: String,
    },
}

impl RelayError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Protocol(_) | RelayError::ProtocolMismatch { .. } => ErrorKind::Protocol,
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::Auth(_) => ErrorKind::Auth,
            RelayError::PacketTooLarge { .. } | RelayError::FrameTooLarge { .. } => ErrorKind::Size,
            RelayError::ConnectionClosed { .. } | RelayError::NotConnected => ErrorKind::Stale,
            RelayError::Closed => ErrorKind::Closed,
            RelayError::Timeout | RelayError::Cancelled => ErrorKind::Timeout,
            RelayError::InvalidUrl { .. } => ErrorKind::Config,
        }
    }

    /// Whether a supervisor may reconnect and try again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Auth | ErrorKind::Closed | ErrorKind::Config
        )
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::Transport(Arc::new(err))
    }
}

impl From<WireError> for RelayError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PacketTooLarge { len, max } => RelayError::PacketTooLarge { len, max },
            WireError::FrameTooLarge { len, max } => RelayError::FrameTooLarge { len, max },
            other => RelayError::Protocol(other),
        }
    }
}
