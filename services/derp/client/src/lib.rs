//! Relay client for the DERP packet relay protocol.
//!
//! This crate provides the client half of a DERP relay: dialing and
//! upgrading the transport, the key-exchange handshake, a framed connection
//! with serialized writes, a reconnecting [`Client`] and the mesh
//! [`WatchLoop`] that mirrors a relay's peer set.
//!
//! ## Features
//!
//! - **Transport**: [`Dialer`] seam with a plain TCP + HTTP upgrade dialer
//! - **Handshake**: ServerKey / ClientInfo / ServerInfo exchange
//! - **Connection**: whole-frame writes, cancel-safe reads, ping/pong
//! - **Client**: single-flight connects and generation tracking
//! - **Watch loop**: presence callbacks with reconnect and jittered backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use derp_client::{Client, ClientConfig, TcpDialer};
//! use derp_wire::{Message, NodePrivate};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), derp_client::RelayError> {
//! let config = ClientConfig::new(NodePrivate::generate(), "http://relay.example/derp".parse()?);
//! let client = Client::new(config, Arc::new(TcpDialer));
//! client.connect().await?;
//!
//! let peer = NodePrivate::generate().public();
//! client.send(&peer, b"hello").await?;
//!
//! while let Ok(msg) = client.recv().await {
//!     if let Message::ReceivedPacket { source, data } = msg {
//!         println!("{} bytes from {}", data.len(), source);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framed;
pub mod handshake;
pub mod transport;
pub mod watch;

pub use backoff::Backoff;
pub use client::{Client, ClientState};
pub use config::{BackoffConfig, ClientConfig, WatchLoopConfig};
pub use connection::Connection;
pub use error::{ErrorKind, RelayError};
pub use framed::{write_frame, FrameReader};
pub use handshake::handshake;
pub use transport::{BoxedStream, Dialer, RelayStream, RelayUrl, TcpDialer};
pub use watch::{
    run_watch_connection_loop, FnPresenceHandler, PresenceHandler, WatchExit, WatchLoop,
    WatchState, WatcherState,
};
