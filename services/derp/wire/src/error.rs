//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported frame header version
    #[error("wire version unsupported: {0}")]
    Version(u8),

    /// Declared or encoded frame payload exceeds the frame limit
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Offending length
        len: usize,
        /// Limit in force
        max: usize,
    },

    /// Packet data exceeds the packet limit
    #[error("packet too large: {len} bytes (max {max})")]
    PacketTooLarge {
        /// Offending length
        len: usize,
        /// Limit in force
        max: usize,
    },

    /// Payload of a known frame type is shorter than its fixed fields
    #[error("short {frame} payload: {len} bytes")]
    Short {
        /// Frame type name
        frame: &'static str,
        /// Payload length received
        len: usize,
    },

    /// ServerKey frame did not start with the protocol magic
    #[error("bad server key magic")]
    Magic,

    /// Malformed key bytes
    #[error("invalid node key: {0}")]
    Key(String),

    /// Sealed box could not be opened
    #[error("box open failed")]
    Open,

    /// Handshake JSON could not be parsed
    #[error("invalid handshake json: {0}")]
    Json(String),

    /// Frame arrived where a different one was required
    #[error("unexpected frame {got:?}, want {want:?}")]
    Unexpected {
        /// Frame type received
        got: crate::FrameType,
        /// Frame type expected
        want: crate::FrameType,
    },

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(String),
}
