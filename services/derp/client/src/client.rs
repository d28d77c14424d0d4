//! Reconnecting relay client.
//!
//! [`Client`] owns at most one live [`Connection`] and a generation counter
//! that increases every time a new connection is installed. Connects are
//! single-flight: concurrent callers join the attempt already in progress
//! and all observe its outcome.

use derp_wire::{Message, NodePublic, PingNonce};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::handshake::handshake;
use crate::transport::{Dialer, RelayUrl};
use crate::RelayError;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Connection>, RelayError>>>;

/// Observable client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and no attempt in progress
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// A live connection is installed
    Connected,
    /// [`Client::close`] was called
    Closed,
}

struct ConnectAttempt {
    generation: u64,
    future: ConnectFuture,
}

#[derive(Default)]
struct Inner {
    conn: Option<Arc<Connection>>,
    generation: u64,
    closed: bool,
    inflight: Option<ConnectAttempt>,
}

/// Relay client
pub struct Client {
    config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    inner: Mutex<Inner>,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Create a client. Nothing is dialed until the first connect.
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            dialer,
            inner: Mutex::new(Inner::default()),
            closed,
        }
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Relay this client connects to
    pub fn url(&self) -> &RelayUrl {
        &self.config.url
    }

    /// Our public key
    pub fn public_key(&self) -> NodePublic {
        self.config.private_key.public()
    }

    /// Generation of the most recently installed connection; 0 before the
    /// first connect
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Relay key from the current connection
    pub fn server_public_key(&self) -> Option<NodePublic> {
        self.lock().conn.as_ref().map(|conn| conn.server_key())
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        let inner = self.lock();
        if inner.closed {
            ClientState::Closed
        } else if inner.conn.as_ref().is_some_and(|conn| !conn.is_closed()) {
            ClientState::Connected
        } else if inner.inflight.is_some() {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        }
    }

    /// Whether [`Client::close`] has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Current connection, if one is installed and alive
    pub fn current_connection(&self) -> Option<Arc<Connection>> {
        self.lock()
            .conn
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Ensure a live connection, bounded by the configured connect timeout.
    ///
    /// Returns immediately when already connected.
    pub async fn connect(&self) -> Result<(), RelayError> {
        match self
            .connect_until(tokio::time::sleep(self.config.connect_timeout))
            .await
        {
            Err(RelayError::Cancelled) => Err(RelayError::Timeout),
            other => other,
        }
    }

    /// Ensure a live connection, giving up when `cancel` resolves.
    ///
    /// Giving up does not abort the shared attempt for other callers. The
    /// attempt itself is bounded by the configured connect timeout.
    pub async fn connect_until<F>(&self, cancel: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let (generation, attempt) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(RelayError::Closed);
            }
            if let Some(conn) = &inner.conn {
                if !conn.is_closed() {
                    return Ok(());
                }
                inner.conn = None;
            }
            match &inner.inflight {
                Some(attempt) => (attempt.generation, attempt.future.clone()),
                None => {
                    let generation = inner.generation + 1;
                    let future = self.start_attempt(generation);
                    inner.inflight = Some(ConnectAttempt {
                        generation,
                        future: future.clone(),
                    });
                    (generation, future)
                }
            }
        };

        let mut closed = self.closed.subscribe();
        let result = tokio::select! {
            result = attempt => result,
            _ = cancel => return Err(RelayError::Cancelled),
            _ = closed.wait_for(|c| *c) => return Err(RelayError::Closed),
        };

        self.install(generation, result).await
    }

    fn start_attempt(&self, generation: u64) -> ConnectFuture {
        let config = self.config.clone();
        let dialer = self.dialer.clone();

        async move {
            let attempt = async {
                debug!("Dialing {} (generation {})", config.url, generation);
                let stream = dialer.dial(&config.url).await?;
                let conn = handshake(stream, &config, generation).await?;
                if config.is_watcher {
                    conn.watch_connection_changes().await?;
                }
                Ok::<_, RelayError>(Arc::new(conn))
            };

            // Bounded here, not by callers, so a hung dial never pins `inflight`
            match tokio::time::timeout(config.connect_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(
                        "Connect attempt {} gave up after {:?}",
                        generation, config.connect_timeout
                    );
                    Err(RelayError::Timeout)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn install(
        &self,
        generation: u64,
        result: Result<Arc<Connection>, RelayError>,
    ) -> Result<(), RelayError> {
        let mut discard = None;
        let outcome = {
            let mut inner = self.lock();
            let first = inner.inflight.as_ref().map(|a| a.generation) == Some(generation);
            if first {
                inner.inflight = None;
            }

            match result {
                Ok(conn) if inner.closed => {
                    discard = Some(conn);
                    Err(RelayError::Closed)
                }
                // Another caller of the same attempt got here first
                Ok(_) if inner.generation >= generation => Ok(()),
                Ok(conn) => {
                    discard = inner.conn.replace(conn.clone());
                    inner.generation = generation;
                    info!(
                        "Connected to relay {} (generation {})",
                        conn.server_key().short_string(),
                        generation
                    );
                    Ok(())
                }
                Err(err) => {
                    if first {
                        warn!("Connect to {} failed: {}", self.config.url, err);
                    }
                    Err(err)
                }
            }
        };

        if let Some(old) = discard {
            old.close().await;
        }
        outcome
    }

    /// Send `data` to `dst`.
    ///
    /// Uses the current connection without reconnecting. A write failure
    /// drops that connection from the client and is reported as
    /// [`RelayError::ConnectionClosed`]; retrying is up to the caller.
    pub async fn send(&self, dst: &NodePublic, data: &[u8]) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.send(dst, data).await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Forward a packet on behalf of `src` (mesh peers only)
    pub async fn forward_packet(
        &self,
        src: &NodePublic,
        dst: &NodePublic,
        data: &[u8],
    ) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.forward_packet(src, dst, data).await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Answer a relay ping
    pub async fn send_pong(&self, nonce: PingNonce) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.send_pong(nonce).await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Mark this relay as preferred or not
    pub async fn note_preferred(&self, preferred: bool) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.note_preferred(preferred).await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Subscribe the current connection to peer presence
    pub async fn watch_connection_changes(&self) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.watch_connection_changes().await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Ask the relay to disconnect `peer`
    pub async fn close_peer(&self, peer: &NodePublic) -> Result<(), RelayError> {
        let conn = self.connection()?;
        let result = conn.close_peer(peer).await;
        result.map_err(|err| self.after_write_failure(&conn, err))
    }

    /// Receive the next message from the current connection
    pub async fn recv(&self) -> Result<Message, RelayError> {
        self.recv_detail().await.map(|(msg, _)| msg)
    }

    /// Receive the next message and the generation of the connection it
    /// arrived on
    pub async fn recv_detail(&self) -> Result<(Message, u64), RelayError> {
        let conn = self.connection()?;
        match conn.recv().await {
            Ok(msg) => Ok((msg, conn.generation())),
            Err(err) => Err(self.after_failure(&conn, err)),
        }
    }

    /// Ping the relay with the given deadline
    pub async fn ping(&self, timeout: Duration) -> Result<(), RelayError> {
        self.ping_until(tokio::time::sleep(timeout)).await
    }

    /// Ping the relay until `cancel` resolves
    pub async fn ping_until<F>(&self, cancel: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let conn = self.connection()?;
        let result = conn.ping_until(cancel).await;
        result.map_err(|err| self.after_failure(&conn, err))
    }

    /// Close and drop the connection of `generation`, if it is still the
    /// current one. Returns whether anything was closed.
    pub async fn invalidate(&self, generation: u64) -> bool {
        let conn = {
            let mut inner = self.lock();
            match &inner.conn {
                Some(conn) if conn.generation() == generation => inner.conn.take(),
                _ => None,
            }
        };
        match conn {
            Some(conn) => {
                debug!("Invalidating connection generation {}", generation);
                conn.close().await;
                true
            }
            None => false,
        }
    }

    /// Close the client. Idempotent.
    ///
    /// Blocked operations return [`RelayError::Closed`]; later operations
    /// fail the same way.
    pub async fn close(&self) -> Result<(), RelayError> {
        let conn = {
            let mut inner = self.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.inflight = None;
            inner.conn.take()
        };
        self.closed.send_replace(true);

        if let Some(conn) = conn {
            conn.close().await;
        }
        info!("Relay client for {} closed", self.config.url);
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Connection>, RelayError> {
        let inner = self.lock();
        if inner.closed {
            return Err(RelayError::Closed);
        }
        inner.conn.clone().ok_or(RelayError::NotConnected)
    }

    fn after_failure(&self, conn: &Connection, err: RelayError) -> RelayError {
        if self.is_closed() {
            return RelayError::Closed;
        }
        if conn.is_closed() {
            let mut inner = self.lock();
            if inner.conn.as_ref().map(|c| c.generation()) == Some(conn.generation()) {
                inner.conn = None;
            }
        }
        err
    }

    fn after_write_failure(&self, conn: &Connection, err: RelayError) -> RelayError {
        match self.after_failure(conn, err) {
            RelayError::Transport(cause) => {
                debug!(
                    "Write on generation {} failed: {}",
                    conn.generation(),
                    cause
                );
                RelayError::ConnectionClosed {
                    generation: conn.generation(),
                }
            }
            other => other,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.config.url)
            .field("public_key", &self.public_key())
            .field("state", &self.state())
            .finish()
    }
}
