//! Wire protocol framing, node keys and message payloads for DERP relay clients.
//!
//! This crate provides the low-level wire protocol implementation used to talk
//! to a DERP relay ("Designated Encrypted Relay for Packets"): frame encoding
//! and incremental decoding, the typed frame catalogue, node identity keys,
//! and the payload layouts of every frame a client sends or receives.
//!
//! ## Features
//!
//! - **Bounded Framing**: declared lengths are checked before any allocation
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Forward Compatible**: unknown frame types decode and can be skipped
//! - **Sealed Handshake**: ClientInfo/ServerInfo sealed to the peer's key
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 wire_version      | currently 1                |
//! +----------------------+----------------------------+
//! | u8 frame_type        | ServerKey, SendPacket, ... |
//! +----------------------+----------------------------+
//! | u32 payload_len      | big-endian, <= 1 MiB       |
//! +----------------------+----------------------------+
//! | payload              | type-specific layout       |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod key;
pub mod message;

// Re-export main types
pub use error::WireError;
pub use frame::{Frame, FrameDecoder};
pub use header::{
    FrameHeader, FrameType, FRAME_HEADER_SIZE, MAGIC, MAX_FRAME_SIZE, MAX_PACKET_SIZE,
    PROTOCOL_VERSION, WIRE_VERSION,
};
pub use key::{NodePrivate, NodePublic, KEY_LEN, NONCE_LEN};
pub use message::{
    build_close_peer, build_forward_packet, build_note_preferred, build_ping, build_pong,
    build_send_packet, build_server_key, build_watch_conns, parse_close_peer,
    parse_forward_packet, parse_send_packet, parse_server_key, ClientInfo, Message,
    PeerGoneReason, PeerPresentFlags, PingNonce, ServerInfo,
};
