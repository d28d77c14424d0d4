//! Fixed frame header for the relay wire protocol.
//!
//! Every frame starts with a 6-byte header: wire version, frame type tag and
//! the big-endian payload length. Payload interpretation is left to
//! [`crate::message`].

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame header format version
pub const WIRE_VERSION: u8 = 1;

/// Protocol version negotiated in ClientInfo / ServerInfo
pub const PROTOCOL_VERSION: u32 = 2;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 6;

/// Maximum frame payload size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Maximum packet data carried by a single packet frame (64 KiB)
pub const MAX_PACKET_SIZE: usize = 64 << 10;

/// Magic prefix of the ServerKey payload
pub const MAGIC: &[u8; 8] = b"DERP\xf0\x9f\x94\x91";

/// Frame types as defined in the relay protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Server's public key, first frame on every connection
    ServerKey,
    /// Client's key and sealed client info
    ClientInfo,
    /// Sealed server info, answers ClientInfo
    ServerInfo,
    /// Client asks relay to deliver a packet
    SendPacket,
    /// Relay delivers a packet
    RecvPacket,
    /// Liveness frame without payload
    KeepAlive,
    /// Client marks this relay as its home
    NotePreferred,
    /// A peer left the relay
    PeerGone,
    /// A peer is connected to the relay
    PeerPresent,
    /// Mesh peer forwards a packet on behalf of another client
    ForwardPacket,
    /// Watcher subscribes to peer presence
    WatchConns,
    /// Watcher asks relay to drop a peer
    ClosePeer,
    /// Ping with 8-byte nonce
    Ping,
    /// Pong echoing a ping nonce
    Pong,
    /// Relay health report
    Health,
    /// Relay announces a restart
    Restarting,
    /// Tag this implementation does not know; payload is still framed
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => FrameType::ServerKey,
            0x02 => FrameType::ClientInfo,
            0x03 => FrameType::ServerInfo,
            0x04 => FrameType::SendPacket,
            0x05 => FrameType::RecvPacket,
            0x06 => FrameType::KeepAlive,
            0x07 => FrameType::NotePreferred,
            0x08 => FrameType::PeerGone,
            0x09 => FrameType::PeerPresent,
            0x0a => FrameType::ForwardPacket,
            0x10 => FrameType::WatchConns,
            0x11 => FrameType::ClosePeer,
            0x12 => FrameType::Ping,
            0x13 => FrameType::Pong,
            0x14 => FrameType::Health,
            0x15 => FrameType::Restarting,
            other => FrameType::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(typ: FrameType) -> Self {
        match typ {
            FrameType::ServerKey => 0x01,
            FrameType::ClientInfo => 0x02,
            FrameType::ServerInfo => 0x03,
            FrameType::SendPacket => 0x04,
            FrameType::RecvPacket => 0x05,
            FrameType::KeepAlive => 0x06,
            FrameType::NotePreferred => 0x07,
            FrameType::PeerGone => 0x08,
            FrameType::PeerPresent => 0x09,
            FrameType::ForwardPacket => 0x0a,
            FrameType::WatchConns => 0x10,
            FrameType::ClosePeer => 0x11,
            FrameType::Ping => 0x12,
            FrameType::Pong => 0x13,
            FrameType::Health => 0x14,
            FrameType::Restarting => 0x15,
            FrameType::Unknown(tag) => tag,
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub typ: FrameType,
    /// Payload length in bytes
    pub len: u32,
}

impl FrameHeader {
    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.typ.into());
        buf.put_u32(self.len);
    }

    /// Decode a header from the front of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` when fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// buffered.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut hdr = &buf[..FRAME_HEADER_SIZE];
        let ver = hdr.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = FrameType::from(hdr.get_u8());
        let len = hdr.get_u32();
        Ok(Some(Self { typ, len }))
    }
}
