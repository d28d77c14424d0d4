//! Typed messages carried by relay frames.
//!
//! [`Message`] is what a client observes when reading from a relay. The
//! `build_*` functions produce the frames each side writes; the matching
//! `parse_*` functions are used by the side that reads them.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::frame::Frame;
use crate::header::{FrameType, MAGIC, MAX_PACKET_SIZE};
use crate::key::{NodePrivate, NodePublic, KEY_LEN};
use crate::WireError;

/// Ping/Pong nonce
pub type PingNonce = [u8; 8];

/// Why a peer left the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerGoneReason {
    /// Peer disconnected from this relay
    Disconnected,
    /// Packet was addressed to a peer that is not connected here
    NotHere,
    /// Reason code this implementation does not know
    Unknown(u8),
}

impl From<u8> for PeerGoneReason {
    fn from(value: u8) -> Self {
        match value {
            0 => PeerGoneReason::Disconnected,
            1 => PeerGoneReason::NotHere,
            other => PeerGoneReason::Unknown(other),
        }
    }
}

impl From<PeerGoneReason> for u8 {
    fn from(reason: PeerGoneReason) -> Self {
        match reason {
            PeerGoneReason::Disconnected => 0,
            PeerGoneReason::NotHere => 1,
            PeerGoneReason::Unknown(code) => code,
        }
    }
}

bitflags! {
    /// Attributes of a present peer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PeerPresentFlags: u8 {
        /// Ordinary client
        const IS_REGULAR = 1 << 0;
        /// Another relay of the same mesh
        const IS_MESH_PEER = 1 << 1;
        /// Health prober
        const IS_PROBER = 1 << 2;
        /// Peer is not connected to its preferred relay
        const NOT_IDEAL_CONN = 1 << 3;
    }
}

/// Handshake reply from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Negotiated protocol version
    pub version: u32,
    /// Rate limit refill in bytes per second (0 means unlimited)
    #[serde(default)]
    pub token_bucket_bytes_per_second: u32,
    /// Rate limit burst in bytes (0 means unlimited)
    #[serde(default)]
    pub token_bucket_bytes_burst: u32,
}

impl ServerInfo {
    /// Seal for the client and wrap in a ServerInfo frame
    pub fn seal(&self, server: &NodePrivate, client: &NodePublic) -> Result<Frame, WireError> {
        let json = serde_json::to_vec(self).map_err(|e| WireError::Json(e.to_string()))?;
        Ok(Frame::new(FrameType::ServerInfo, server.seal_to(client, &json)?))
    }

    /// Open a ServerInfo frame sent by `server`
    pub fn open(frame: &Frame, client: &NodePrivate, server: &NodePublic) -> Result<Self, WireError> {
        expect_type(frame, FrameType::ServerInfo)?;
        let json = client.open_from(server, &frame.payload)?;
        serde_json::from_slice(&json).map_err(|e| WireError::Json(e.to_string()))
    }
}

/// Client identification sent during the handshake
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Protocol version the client speaks
    pub version: u32,
    /// Shared mesh secret, present for watcher clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_key: Option<String>,
    /// Client answers relay pings
    #[serde(default)]
    pub can_ack_pings: bool,
    /// Client is a health prober
    #[serde(default)]
    pub is_prober: bool,
}

impl fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInfo")
            .field("version", &self.version)
            .field("mesh_key", &self.mesh_key.as_ref().map(|_| "<redacted>"))
            .field("can_ack_pings", &self.can_ack_pings)
            .field("is_prober", &self.is_prober)
            .finish()
    }
}

impl ClientInfo {
    /// Seal for the relay and wrap in a ClientInfo frame carrying our public key
    pub fn seal(&self, client: &NodePrivate, server: &NodePublic) -> Result<Frame, WireError> {
        let json = serde_json::to_vec(self).map_err(|e| WireError::Json(e.to_string()))?;
        let sealed = client.seal_to(server, &json)?;

        let mut buf = BytesMut::with_capacity(KEY_LEN + sealed.len());
        buf.put_slice(client.public().as_bytes());
        buf.put_slice(&sealed);
        Ok(Frame::new(FrameType::ClientInfo, buf.freeze()))
    }

    /// Open a ClientInfo frame, returning the sender's key and its info
    pub fn open(frame: &Frame, server: &NodePrivate) -> Result<(NodePublic, Self), WireError> {
        expect_type(frame, FrameType::ClientInfo)?;
        let client = NodePublic::from_slice(&frame.payload)?;
        let json = server.open_from(&client, &frame.payload[KEY_LEN..])?;
        let info = serde_json::from_slice(&json).map_err(|e| WireError::Json(e.to_string()))?;
        Ok((client, info))
    }
}

/// Messages a client can receive from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake reply, surfaced once per connection
    ServerInfo(ServerInfo),
    /// A peer is connected to the relay
    PeerPresent {
        /// Peer key
        key: NodePublic,
        /// Peer's address as seen by the relay, if reported
        addr: Option<SocketAddr>,
        /// Peer attributes
        flags: PeerPresentFlags,
    },
    /// A peer left, or a packet was sent to an absent peer
    PeerGone {
        /// Peer key
        key: NodePublic,
        /// Reason code
        reason: PeerGoneReason,
    },
    /// Packet relayed from another client
    ReceivedPacket {
        /// Sender key
        source: NodePublic,
        /// Packet data
        data: Bytes,
    },
    /// Relay ping, answer with a pong carrying the same nonce
    Ping(PingNonce),
    /// Answer to one of our pings
    Pong(PingNonce),
    /// Liveness only
    KeepAlive,
    /// Relay health; `None` means healthy
    Health {
        /// Problem description
        problem: Option<String>,
    },
    /// Relay is restarting
    Restarting {
        /// Suggested delay before reconnecting
        reconnect_in: Duration,
        /// How long to keep trying
        try_for: Duration,
    },
}

impl Message {
    /// Parse a frame read by a client.
    ///
    /// Returns `Ok(None)` for frame types that carry no client-facing
    /// message (unknown tags and client-to-relay types). ServerInfo needs the
    /// session keys and is opened with [`ServerInfo::open`] instead.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, WireError> {
        let mut p = frame.payload.clone();
        let msg = match frame.typ {
            FrameType::RecvPacket => {
                let source = take_key(&mut p, "RecvPacket")?;
                if p.len() > MAX_PACKET_SIZE {
                    return Err(WireError::PacketTooLarge {
                        len: p.len(),
                        max: MAX_PACKET_SIZE,
                    });
                }
                Message::ReceivedPacket { source, data: p }
            }
            FrameType::KeepAlive => Message::KeepAlive,
            FrameType::PeerGone => {
                let key = take_key(&mut p, "PeerGone")?;
                let reason = if p.has_remaining() {
                    PeerGoneReason::from(p.get_u8())
                } else {
                    PeerGoneReason::Disconnected
                };
                Message::PeerGone { key, reason }
            }
            FrameType::PeerPresent => {
                let key = take_key(&mut p, "PeerPresent")?;
                let addr = if p.remaining() >= 18 {
                    let mut ip = [0u8; 16];
                    p.copy_to_slice(&mut ip);
                    let port = p.get_u16();
                    let ip = Ipv6Addr::from(ip);
                    // `[::]:0` stands in for "no address" when flags follow
                    (!(ip.is_unspecified() && port == 0))
                        .then(|| SocketAddr::new(unmap_ip(ip), port))
                } else {
                    None
                };
                let flags = if p.has_remaining() {
                    PeerPresentFlags::from_bits_truncate(p.get_u8())
                } else {
                    PeerPresentFlags::empty()
                };
                Message::PeerPresent { key, addr, flags }
            }
            FrameType::Ping => Message::Ping(parse_nonce(&p, "Ping")?),
            FrameType::Pong => Message::Pong(parse_nonce(&p, "Pong")?),
            FrameType::Health => {
                let text = std::str::from_utf8(&p)
                    .map_err(|_| WireError::Malformed("health text is not utf-8".to_string()))?;
                Message::Health {
                    problem: (!text.is_empty()).then(|| text.to_string()),
                }
            }
            FrameType::Restarting => {
                if p.len() < 8 {
                    return Err(WireError::Short {
                        frame: "Restarting",
                        len: p.len(),
                    });
                }
                Message::Restarting {
                    reconnect_in: Duration::from_millis(p.get_u32() as u64),
                    try_for: Duration::from_millis(p.get_u32() as u64),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Encode a relay-to-client message as a frame.
    ///
    /// Fails for [`Message::ServerInfo`], which must be sealed with
    /// [`ServerInfo::seal`].
    pub fn to_frame(&self) -> Result<Frame, WireError> {
        let frame = match self {
            Message::ServerInfo(_) => {
                return Err(WireError::Malformed("ServerInfo must be sealed".to_string()))
            }
            Message::PeerPresent { key, addr, flags } => {
                let mut buf = BytesMut::with_capacity(KEY_LEN + 19);
                buf.put_slice(key.as_bytes());
                // Flags sit after the address, so they force one onto the wire
                if addr.is_some() || !flags.is_empty() {
                    let (ip, port) = match addr {
                        Some(addr) => match addr.ip() {
                            IpAddr::V4(v4) => (v4.to_ipv6_mapped(), addr.port()),
                            IpAddr::V6(v6) => (v6, addr.port()),
                        },
                        None => (Ipv6Addr::UNSPECIFIED, 0),
                    };
                    buf.put_slice(&ip.octets());
                    buf.put_u16(port);
                    buf.put_u8(flags.bits());
                }
                Frame::new(FrameType::PeerPresent, buf.freeze())
            }
            Message::PeerGone { key, reason } => {
                let mut buf = BytesMut::with_capacity(KEY_LEN + 1);
                buf.put_slice(key.as_bytes());
                buf.put_u8((*reason).into());
                Frame::new(FrameType::PeerGone, buf.freeze())
            }
            Message::ReceivedPacket { source, data } => {
                check_packet_size(data.len())?;
                let mut buf = BytesMut::with_capacity(KEY_LEN + data.len());
                buf.put_slice(source.as_bytes());
                buf.put_slice(data);
                Frame::new(FrameType::RecvPacket, buf.freeze())
            }
            Message::Ping(nonce) => build_ping(*nonce),
            Message::Pong(nonce) => build_pong(*nonce),
            Message::KeepAlive => Frame::empty(FrameType::KeepAlive),
            Message::Health { problem } => Frame::new(
                FrameType::Health,
                Bytes::from(problem.clone().unwrap_or_default()),
            ),
            Message::Restarting {
                reconnect_in,
                try_for,
            } => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u32(reconnect_in.as_millis().min(u32::MAX as u128) as u32);
                buf.put_u32(try_for.as_millis().min(u32::MAX as u128) as u32);
                Frame::new(FrameType::Restarting, buf.freeze())
            }
        };
        Ok(frame)
    }
}

/// Build the ServerKey frame a relay opens every connection with
pub fn build_server_key(server: &NodePublic) -> Frame {
    let mut buf = BytesMut::with_capacity(MAGIC.len() + KEY_LEN);
    buf.put_slice(MAGIC);
    buf.put_slice(server.as_bytes());
    Frame::new(FrameType::ServerKey, buf.freeze())
}

/// Parse a ServerKey frame, checking the protocol magic
pub fn parse_server_key(frame: &Frame) -> Result<NodePublic, WireError> {
    expect_type(frame, FrameType::ServerKey)?;
    let payload = &frame.payload;
    if payload.len() < MAGIC.len() + KEY_LEN {
        return Err(WireError::Short {
            frame: "ServerKey",
            len: payload.len(),
        });
    }
    if &payload[..MAGIC.len()] != MAGIC {
        return Err(WireError::Magic);
    }
    NodePublic::from_slice(&payload[MAGIC.len()..])
}

/// Build a SendPacket frame
pub fn build_send_packet(dst: &NodePublic, data: &[u8]) -> Result<Frame, WireError> {
    check_packet_size(data.len())?;
    let mut buf = BytesMut::with_capacity(KEY_LEN + data.len());
    buf.put_slice(dst.as_bytes());
    buf.put_slice(data);
    Ok(Frame::new(FrameType::SendPacket, buf.freeze()))
}

/// Parse a SendPacket frame into destination and data
pub fn parse_send_packet(frame: &Frame) -> Result<(NodePublic, Bytes), WireError> {
    expect_type(frame, FrameType::SendPacket)?;
    let mut p = frame.payload.clone();
    let dst = take_key(&mut p, "SendPacket")?;
    check_packet_size(p.len())?;
    Ok((dst, p))
}

/// Build a ForwardPacket frame (mesh peers only)
pub fn build_forward_packet(
    src: &NodePublic,
    dst: &NodePublic,
    data: &[u8],
) -> Result<Frame, WireError> {
    check_packet_size(data.len())?;
    let mut buf = BytesMut::with_capacity(2 * KEY_LEN + data.len());
    buf.put_slice(src.as_bytes());
    buf.put_slice(dst.as_bytes());
    buf.put_slice(data);
    Ok(Frame::new(FrameType::ForwardPacket, buf.freeze()))
}

/// Parse a ForwardPacket frame into source, destination and data
pub fn parse_forward_packet(frame: &Frame) -> Result<(NodePublic, NodePublic, Bytes), WireError> {
    expect_type(frame, FrameType::ForwardPacket)?;
    let mut p = frame.payload.clone();
    let src = take_key(&mut p, "ForwardPacket")?;
    let dst = take_key(&mut p, "ForwardPacket")?;
    check_packet_size(p.len())?;
    Ok((src, dst, p))
}

/// Build a PING frame
pub fn build_ping(nonce: PingNonce) -> Frame {
    Frame::new(FrameType::Ping, Bytes::copy_from_slice(&nonce))
}

/// Build a PONG frame in response to a PING
pub fn build_pong(nonce: PingNonce) -> Frame {
    Frame::new(FrameType::Pong, Bytes::copy_from_slice(&nonce))
}

/// Build a NotePreferred frame
pub fn build_note_preferred(preferred: bool) -> Frame {
    Frame::new(FrameType::NotePreferred, vec![preferred as u8])
}

/// Build a WatchConns subscription frame
pub fn build_watch_conns() -> Frame {
    Frame::empty(FrameType::WatchConns)
}

/// Build a ClosePeer frame
pub fn build_close_peer(key: &NodePublic) -> Frame {
    Frame::new(FrameType::ClosePeer, Bytes::copy_from_slice(key.as_bytes()))
}

/// Parse a ClosePeer frame
pub fn parse_close_peer(frame: &Frame) -> Result<NodePublic, WireError> {
    expect_type(frame, FrameType::ClosePeer)?;
    NodePublic::from_slice(&frame.payload)
}

fn expect_type(frame: &Frame, want: FrameType) -> Result<(), WireError> {
    if frame.typ != want {
        return Err(WireError::Unexpected {
            got: frame.typ,
            want,
        });
    }
    Ok(())
}

fn take_key(p: &mut Bytes, frame: &'static str) -> Result<NodePublic, WireError> {
    if p.len() < KEY_LEN {
        return Err(WireError::Short { frame, len: p.len() });
    }
    NodePublic::from_slice(&p.split_to(KEY_LEN))
}

fn parse_nonce(p: &[u8], frame: &'static str) -> Result<PingNonce, WireError> {
    p.get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::Short { frame, len: p.len() })
}

fn check_packet_size(len: usize) -> Result<(), WireError> {
    if len > MAX_PACKET_SIZE {
        return Err(WireError::PacketTooLarge {
            len,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(())
}

fn unmap_ip(ip: Ipv6Addr) -> IpAddr {
    match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    }
}
