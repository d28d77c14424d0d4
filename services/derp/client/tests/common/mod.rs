//! In-memory relay for integration tests.
//!
//! Each dial creates a `tokio::io::duplex` pipe served by a task speaking
//! the relay side of the protocol: handshake, packet delivery, presence for
//! watchers, ping answers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use derp_client::{
    write_frame, BoxedStream, Client, ClientConfig, Dialer, FrameReader, RelayError, RelayUrl,
};
use derp_wire::{
    build_pong, build_server_key, parse_forward_packet, parse_send_packet, ClientInfo, Frame,
    FrameType, Message, NodePrivate, NodePublic, PeerGoneReason, PeerPresentFlags, ServerInfo,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};
use tokio::sync::{mpsc, Notify};

pub fn relay_url() -> RelayUrl {
    "http://relay.test/derp".parse().unwrap()
}

struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
    kill: Arc<Notify>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<NodePublic, Peer>,
    watchers: HashMap<u64, mpsc::UnboundedSender<Frame>>,
}

struct Inner {
    key: NodePrivate,
    mesh_key: Option<String>,
    answer_pings: AtomicBool,
    dials: AtomicUsize,
    dial_delay: Mutex<Duration>,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

/// Relay shared by every client dialed through its [`TestDialer`]
#[derive(Clone)]
pub struct TestRelay {
    inner: Arc<Inner>,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::build(NodePrivate::generate(), None)
    }

    pub fn with_mesh_key(mesh_key: &str) -> Self {
        Self::build(NodePrivate::generate(), Some(mesh_key.to_string()))
    }

    pub fn with_key(key: NodePrivate, mesh_key: Option<&str>) -> Self {
        Self::build(key, mesh_key.map(str::to_string))
    }

    fn build(key: NodePrivate, mesh_key: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                mesh_key,
                answer_pings: AtomicBool::new(true),
                dials: AtomicUsize::new(0),
                dial_delay: Mutex::new(Duration::ZERO),
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn public_key(&self) -> NodePublic {
        self.inner.key.public()
    }

    pub fn dialer(&self) -> Arc<TestDialer> {
        Arc::new(TestDialer {
            inner: self.inner.clone(),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.inner.answer_pings.store(answer, Ordering::SeqCst);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.inner.dial_delay.lock().unwrap() = delay;
    }

    /// Drop `key`'s connection from the relay side. Returns whether it was
    /// connected.
    pub fn kick(&self, key: &NodePublic) -> bool {
        let registry = self.inner.registry.lock().unwrap();
        match registry.clients.get(key) {
            Some(peer) => {
                peer.kill.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.registry.lock().unwrap().clients.len()
    }

    /// Regular client for `key`
    pub fn client(&self, key: NodePrivate) -> Arc<Client> {
        Arc::new(Client::new(ClientConfig::new(key, relay_url()), self.dialer()))
    }

    /// Watcher client presenting `mesh_key`
    pub fn watcher(&self, key: NodePrivate, mesh_key: &str) -> Arc<Client> {
        let config = ClientConfig::new(key, relay_url()).with_watcher(mesh_key);
        Arc::new(Client::new(config, self.dialer()))
    }
}

#[derive(Clone)]
pub struct TestDialer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TestDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDialer")
            .field("relay", &self.inner.key.public())
            .finish()
    }
}

#[async_trait]
impl Dialer for TestDialer {
    async fn dial(&self, _url: &RelayUrl) -> io::Result<BoxedStream> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.dial_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (client_side, relay_side) = tokio::io::duplex(1 << 20);
        tokio::spawn(serve(self.inner.clone(), relay_side));
        Ok(Box::new(client_side))
    }
}

async fn serve(inner: Arc<Inner>, stream: DuplexStream) {
    if let Err(err) = serve_conn(inner, stream).await {
        tracing::debug!("test relay connection ended: {}", err);
    }
}

async fn serve_conn(inner: Arc<Inner>, stream: DuplexStream) -> Result<(), RelayError> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    write_frame(&mut write_half, &build_server_key(&inner.key.public())).await?;
    let frame = reader.read_frame().await?;
    let (client_key, info) = ClientInfo::open(&frame, &inner.key)?;

    let is_mesh = match &info.mesh_key {
        Some(presented) if Some(presented) == inner.mesh_key.as_ref() => true,
        Some(_) => {
            let health = Frame::new(FrameType::Health, &b"mesh key mismatch"[..]);
            write_frame(&mut write_half, &health).await?;
            return Ok(());
        }
        None => false,
    };

    // Registered before ServerInfo goes out, so a connected client is
    // always reachable; queued frames follow ServerInfo.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let kill = Arc::new(Notify::new());
    inner.register(client_key, id, tx.clone(), kill.clone());

    let server_info = ServerInfo {
        version: PROTOCOL_VERSION,
        token_bucket_bytes_per_second: 0,
        token_bucket_bytes_burst: 0,
    };
    if let Err(err) = write_frame(&mut write_half, &server_info.seal(&inner.key, &client_key)?).await {
        inner.unregister(client_key, id);
        return Err(err);
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let result = tokio::select! {
        result = read_loop(&inner, &mut reader, client_key, id, is_mesh, &tx) => result,
        _ = kill.notified() => Ok(()),
    };
    inner.unregister(client_key, id);
    drop(tx);
    writer.abort();
    result
}

async fn read_loop(
    inner: &Inner,
    reader: &mut FrameReader<ReadHalf<DuplexStream>>,
    client_key: NodePublic,
    id: u64,
    is_mesh: bool,
    tx: &mpsc::UnboundedSender<Frame>,
) -> Result<(), RelayError> {
    loop {
        let frame = reader.read_frame().await?;
        match frame.typ {
            FrameType::SendPacket => {
                let (dst, data) = parse_send_packet(&frame)?;
                if !inner.deliver(client_key, dst, data) {
                    let gone = Message::PeerGone {
                        key: dst,
                        reason: PeerGoneReason::NotHere,
                    };
                    let _ = tx.send(gone.to_frame()?);
                }
            }
            FrameType::ForwardPacket if is_mesh => {
                let (src, dst, data) = parse_forward_packet(&frame)?;
                inner.deliver(src, dst, data);
            }
            FrameType::WatchConns if is_mesh => inner.add_watcher(id, tx.clone()),
            FrameType::Ping => {
                if inner.answer_pings.load(Ordering::SeqCst) {
                    let mut nonce = [0u8; 8];
                    nonce.copy_from_slice(&frame.payload[..8]);
                    let _ = tx.send(build_pong(nonce));
                }
            }
            _ => {}
        }
    }
}

impl Inner {
    fn register(&self, key: NodePublic, id: u64, tx: mpsc::UnboundedSender<Frame>, kill: Arc<Notify>) {
        let mut registry = self.registry.lock().unwrap();
        registry.clients.insert(key, Peer { id, tx, kill });
        let present = present_frame(key);
        for watcher in registry.watchers.values() {
            let _ = watcher.send(present.clone());
        }
    }

    fn unregister(&self, key: NodePublic, id: u64) {
        let mut registry = self.registry.lock().unwrap();
        registry.watchers.remove(&id);
        if registry.clients.get(&key).map(|peer| peer.id) != Some(id) {
            return;
        }
        registry.clients.remove(&key);

        let gone = Message::PeerGone {
            key,
            reason: PeerGoneReason::Disconnected,
        }
        .to_frame()
        .unwrap();
        for watcher in registry.watchers.values() {
            let _ = watcher.send(gone.clone());
        }
    }

    fn add_watcher(&self, id: u64, tx: mpsc::UnboundedSender<Frame>) {
        let mut registry = self.registry.lock().unwrap();
        for key in registry.clients.keys() {
            let _ = tx.send(present_frame(*key));
        }
        registry.watchers.insert(id, tx);
    }

    fn deliver(&self, source: NodePublic, dst: NodePublic, data: Bytes) -> bool {
        let registry = self.registry.lock().unwrap();
        match registry.clients.get(&dst) {
            Some(peer) => {
                let frame = Message::ReceivedPacket { source, data }.to_frame().unwrap();
                let _ = peer.tx.send(frame);
                true
            }
            None => false,
        }
    }
}

fn present_frame(key: NodePublic) -> Frame {
    Message::PeerPresent {
        key,
        addr: None,
        flags: PeerPresentFlags::IS_REGULAR,
    }
    .to_frame()
    .unwrap()
}

/// Spawn a task pumping `client.recv()` into a channel until it fails
pub fn spawn_reader(client: Arc<Client>) -> mpsc::UnboundedReceiver<Result<Message, RelayError>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let result = client.recv().await;
            let failed = result.is_err();
            if tx.send(result).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Next received packet, skipping other messages
pub async fn next_packet(
    rx: &mut mpsc::UnboundedReceiver<Result<Message, RelayError>>,
) -> (NodePublic, Bytes) {
    loop {
        match rx.recv().await {
            Some(Ok(Message::ReceivedPacket { source, data })) => return (source, data),
            Some(Ok(_)) => continue,
            Some(Err(err)) => panic!("recv failed: {}", err),
            None => panic!("reader stopped"),
        }
    }
}
