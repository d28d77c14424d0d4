//! One handshaken relay connection.
//!
//! A [`Connection`] owns both halves of its stream. Writes go through a
//! mutex so every frame reaches the wire whole; reads go through a separate
//! mutex so `recv` and `send` never wait on each other. The first I/O or
//! protocol failure closes the connection for good: there is no resync.
//! Dropping a `send` part way through its frame counts as such a failure.

use dashmap::DashMap;
use derp_wire::{
    build_close_peer, build_forward_packet, build_note_preferred, build_ping, build_pong,
    build_send_packet, build_watch_conns, Frame, FrameType, Message, NodePrivate, NodePublic,
    PingNonce, ServerInfo,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace};

use crate::framed::FrameReader;
use crate::transport::BoxedStream;
use crate::RelayError;

/// Bound on the write-side shutdown performed by [`Connection::close`]
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Live connection to a relay
pub struct Connection {
    generation: u64,
    private_key: NodePrivate,
    server_key: NodePublic,
    server_info: ServerInfo,
    server_info_pending: AtomicBool,
    reader: Mutex<FrameReader<ReadHalf<BoxedStream>>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    pings: DashMap<PingNonce, oneshot::Sender<()>>,
    closed: watch::Sender<bool>,
}

/// Removes a ping waiter however the ping ends
struct PendingPing<'a> {
    pings: &'a DashMap<PingNonce, oneshot::Sender<()>>,
    nonce: PingNonce,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        self.pings.remove(&self.nonce);
    }
}

/// Closes the connection if a frame write is dropped part way, since the
/// peer would otherwise splice the next frame into the truncated one
struct WriteInProgress<'a> {
    conn: &'a Connection,
    armed: bool,
}

impl WriteInProgress<'_> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for WriteInProgress<'_> {
    fn drop(&mut self) {
        if self.armed && self.conn.mark_closed() {
            debug!(
                "Write abandoned mid-frame, closing generation {}",
                self.conn.generation
            );
        }
    }
}

impl Connection {
    pub(crate) fn new(
        generation: u64,
        private_key: NodePrivate,
        server_key: NodePublic,
        server_info: ServerInfo,
        reader: FrameReader<ReadHalf<BoxedStream>>,
        writer: WriteHalf<BoxedStream>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            generation,
            private_key,
            server_key,
            server_info,
            server_info_pending: AtomicBool::new(true),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            pings: DashMap::new(),
            closed,
        }
    }

    /// Generation this connection was installed under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Our public key
    pub fn local_key(&self) -> NodePublic {
        self.private_key.public()
    }

    /// Relay's public key, learned during the handshake
    pub fn server_key(&self) -> NodePublic {
        self.server_key
    }

    /// ServerInfo received during the handshake
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Whether the connection has been closed or has failed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Pings awaiting their pong
    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    /// Send `data` to `dst` through the relay.
    ///
    /// Oversized data fails with [`RelayError::PacketTooLarge`] and leaves
    /// the connection usable.
    pub async fn send(&self, dst: &NodePublic, data: &[u8]) -> Result<(), RelayError> {
        self.ensure_open()?;
        let frame = build_send_packet(dst, data)?;
        self.write(&frame).await
    }

    /// Forward a packet from `src` to `dst` (mesh peers only)
    pub async fn forward_packet(
        &self,
        src: &NodePublic,
        dst: &NodePublic,
        data: &[u8],
    ) -> Result<(), RelayError> {
        self.ensure_open()?;
        let frame = build_forward_packet(src, dst, data)?;
        self.write(&frame).await
    }

    /// Answer a relay ping
    pub async fn send_pong(&self, nonce: PingNonce) -> Result<(), RelayError> {
        self.write(&build_pong(nonce)).await
    }

    /// Tell the relay whether it is our preferred (home) relay
    pub async fn note_preferred(&self, preferred: bool) -> Result<(), RelayError> {
        self.write(&build_note_preferred(preferred)).await
    }

    /// Subscribe to peer presence updates
    pub async fn watch_connection_changes(&self) -> Result<(), RelayError> {
        self.write(&build_watch_conns()).await
    }

    /// Ask the relay to drop `peer`
    pub async fn close_peer(&self, peer: &NodePublic) -> Result<(), RelayError> {
        self.write(&build_close_peer(peer)).await
    }

    /// Receive the next message.
    ///
    /// The handshake's ServerInfo is returned first. Frames of unknown type
    /// are skipped. Any read or parse failure closes the connection.
    pub async fn recv(&self) -> Result<Message, RelayError> {
        self.ensure_open()?;
        if self.server_info_pending.swap(false, Ordering::AcqRel) {
            return Ok(Message::ServerInfo(self.server_info.clone()));
        }

        let mut closed = self.closed.subscribe();
        let mut reader = tokio::select! {
            reader = self.reader.lock() => reader,
            _ = closed.wait_for(|c| *c) => return Err(self.closed_error()),
        };

        loop {
            let frame = tokio::select! {
                result = reader.read_frame() => match result {
                    Ok(frame) => frame,
                    Err(err) => return Err(self.fail(err)),
                },
                _ = closed.wait_for(|c| *c) => return Err(self.closed_error()),
            };

            match self.parse(&frame) {
                Ok(Some(msg)) => {
                    if let Message::Pong(nonce) = &msg {
                        self.resolve_ping(nonce);
                    }
                    return Ok(msg);
                }
                Ok(None) => {
                    trace!("Skipping frame type {:?}", frame.typ);
                }
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Ping the relay, waiting for the pong until `cancel` resolves.
    ///
    /// The pong is matched by whichever task is calling [`Connection::recv`];
    /// without a reader the ping can only time out.
    pub async fn ping_until<F>(&self, cancel: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        self.ensure_open()?;

        let nonce: PingNonce = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pings.insert(nonce, tx);
        let _pending = PendingPing {
            pings: &self.pings,
            nonce,
        };

        self.write(&build_ping(nonce)).await?;

        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = rx => result.map_err(|_| self.closed_error()),
            _ = cancel => Err(RelayError::Timeout),
            _ = closed.wait_for(|c| *c) => Err(self.closed_error()),
        }
    }

    /// Ping the relay with a deadline
    pub async fn ping(&self, timeout: Duration) -> Result<(), RelayError> {
        self.ping_until(tokio::time::sleep(timeout)).await
    }

    /// Close the connection. Idempotent.
    ///
    /// Blocked `recv`, `send` and `ping` calls return
    /// [`RelayError::ConnectionClosed`].
    pub async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!("Closing connection generation {}", self.generation);

        let mut writer = self.writer.lock().await;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown())
            .await
            .is_err()
        {
            debug!("Shutdown of generation {} timed out", self.generation);
        }
    }

    async fn write(&self, frame: &Frame) -> Result<(), RelayError> {
        self.ensure_open()?;
        let bytes = frame.encode()?;

        let mut closed = self.closed.subscribe();
        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = closed.wait_for(|c| *c) => return Err(self.closed_error()),
        };

        let in_progress = WriteInProgress {
            conn: self,
            armed: true,
        };
        let result = tokio::select! {
            result = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => result,
            _ = closed.wait_for(|c| *c) => return Err(self.closed_error()),
        };
        in_progress.finish();

        match result {
            Ok(()) => {
                trace!("Wrote {:?} frame ({} bytes)", frame.typ, bytes.len());
                Ok(())
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn parse(&self, frame: &Frame) -> Result<Option<Message>, RelayError> {
        if frame.typ == FrameType::ServerInfo {
            let info = ServerInfo::open(frame, &self.private_key, &self.server_key)?;
            return Ok(Some(Message::ServerInfo(info)));
        }
        Ok(Message::from_frame(frame)?)
    }

    fn resolve_ping(&self, nonce: &PingNonce) {
        if let Some((_, waiter)) = self.pings.remove(nonce) {
            let _ = waiter.send(());
        }
    }

    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn closed_error(&self) -> RelayError {
        RelayError::ConnectionClosed {
            generation: self.generation,
        }
    }

    /// Mark closed after a failure and pass the error through
    fn fail(&self, err: RelayError) -> RelayError {
        if self.mark_closed() {
            debug!("Connection generation {} failed: {}", self.generation, err);
        }
        err
    }

    /// Returns true for the call that actually closed the connection
    fn mark_closed(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        self.pings.clear();
        !was_closed
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("server_key", &self.server_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}
