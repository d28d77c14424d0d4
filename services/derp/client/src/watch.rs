//! Mesh watch loop.
//!
//! Keeps a watcher client subscribed to peer presence on one relay and
//! mirrors the relay's peer set into a [`PresenceHandler`]. For any peer the
//! handler sees strictly alternating `peer_added` / `peer_removed` calls:
//! whenever the connection is lost or replaced every known peer is removed
//! before the next connection's announcements are applied.
//!
//! Handlers run on the loop's task. A slow handler delays reading from the
//! relay.

use derp_wire::{Message, NodePublic, PeerGoneReason};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::client::Client;
use crate::config::WatchLoopConfig;
use crate::RelayError;

/// Receives peer presence changes
pub trait PresenceHandler: Send + Sync {
    /// A peer connected to the relay
    fn peer_added(&self, key: NodePublic, addr: Option<SocketAddr>);
    /// A peer left, or we lost sight of it
    fn peer_removed(&self, key: NodePublic);
}

impl<H: PresenceHandler + ?Sized> PresenceHandler for Arc<H> {
    fn peer_added(&self, key: NodePublic, addr: Option<SocketAddr>) {
        (**self).peer_added(key, addr)
    }

    fn peer_removed(&self, key: NodePublic) {
        (**self).peer_removed(key)
    }
}

/// [`PresenceHandler`] built from two closures
pub struct FnPresenceHandler<A, R> {
    on_add: A,
    on_remove: R,
}

impl<A, R> FnPresenceHandler<A, R>
where
    A: Fn(NodePublic, Option<SocketAddr>) + Send + Sync,
    R: Fn(NodePublic) + Send + Sync,
{
    /// Wrap the two callbacks
    pub fn new(on_add: A, on_remove: R) -> Self {
        Self { on_add, on_remove }
    }
}

impl<A, R> PresenceHandler for FnPresenceHandler<A, R>
where
    A: Fn(NodePublic, Option<SocketAddr>) + Send + Sync,
    R: Fn(NodePublic) + Send + Sync,
{
    fn peer_added(&self, key: NodePublic, addr: Option<SocketAddr>) {
        (self.on_add)(key, addr)
    }

    fn peer_removed(&self, key: NodePublic) {
        (self.on_remove)(key)
    }
}

/// Lifecycle of a watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Not running, or finished
    Disconnected,
    /// Connecting and subscribing
    Connecting,
    /// Receiving presence updates
    Watching,
    /// Waiting before the next attempt
    Backoff,
}

/// Why a watch loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchExit {
    /// Shutdown future resolved
    Shutdown,
    /// The client was closed
    ClientClosed,
    /// The relay turned out to be the node we must ignore
    SelfConnect,
    /// The relay rejected our credentials
    Rejected(String),
}

/// Peers currently known to be present
#[derive(Debug, Default)]
pub struct WatcherState {
    present: HashMap<NodePublic, Option<SocketAddr>>,
}

impl WatcherState {
    /// Number of present peers
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Whether no peer is present
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &NodePublic) -> bool {
        self.present.contains_key(key)
    }

    fn add(&mut self, key: NodePublic, addr: Option<SocketAddr>, handler: &dyn PresenceHandler) {
        match self.present.insert(key, addr) {
            None => handler.peer_added(key, addr),
            Some(old) if old != addr => {
                debug!("Peer {} moved {:?} -> {:?}", key.short_string(), old, addr);
            }
            Some(_) => {}
        }
    }

    fn remove(&mut self, key: &NodePublic, handler: &dyn PresenceHandler) {
        if self.present.remove(key).is_some() {
            handler.peer_removed(*key);
        }
    }

    fn clear(&mut self, handler: &dyn PresenceHandler) {
        for (key, _) in self.present.drain() {
            handler.peer_removed(key);
        }
    }
}

enum SessionEnd {
    SelfConnect,
    Failed(RelayError),
}

/// Reconnecting presence watcher for one relay
pub struct WatchLoop<H> {
    client: Arc<Client>,
    ignore_server_key: NodePublic,
    handler: H,
    config: WatchLoopConfig,
    state: watch::Sender<WatchState>,
}

impl<H: PresenceHandler> WatchLoop<H> {
    /// Watch the relay `client` points at, stopping if it turns out to be
    /// `ignore_server_key`
    pub fn new(client: Arc<Client>, ignore_server_key: NodePublic, handler: H) -> Self {
        let (state, _) = watch::channel(WatchState::Disconnected);
        Self {
            client,
            ignore_server_key,
            handler,
            config: WatchLoopConfig::default(),
            state,
        }
    }

    /// Override backoff and status settings
    pub fn with_config(mut self, config: WatchLoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe the loop's state
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` resolves, the client closes, the relay rejects
    /// us, or the relay is ourselves. Transient failures are retried
    /// forever.
    pub async fn run<S>(self, shutdown: S) -> WatchExit
    where
        S: Future<Output = ()>,
    {
        let span = info_span!("watch", relay = %self.client.url());
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner<S>(self, shutdown: S) -> WatchExit
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut peers = WatcherState::default();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut last_generation = 0u64;

        let exit = loop {
            let end = tokio::select! {
                end = self.session(&mut peers, &mut last_generation, &mut backoff) => end,
                _ = &mut shutdown => break WatchExit::Shutdown,
            };
            peers.clear(&self.handler);

            let err = match end {
                SessionEnd::SelfConnect => break WatchExit::SelfConnect,
                SessionEnd::Failed(err) => err,
            };
            match err {
                RelayError::Closed => break WatchExit::ClientClosed,
                RelayError::Auth(problem) => {
                    error!("Relay rejected watcher: {}", problem);
                    break WatchExit::Rejected(problem);
                }
                err => {
                    let delay = backoff.next_delay();
                    warn!("Watch failed: {}; retrying in {:?}", err, delay);
                    self.state.send_replace(WatchState::Backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut shutdown => break WatchExit::Shutdown,
                    }
                }
            }
        };

        peers.clear(&self.handler);
        self.state.send_replace(WatchState::Disconnected);
        info!("Watch loop stopped: {:?}", exit);
        exit
    }

    async fn session(
        &self,
        peers: &mut WatcherState,
        last_generation: &mut u64,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        self.state.send_replace(WatchState::Connecting);
        if let Err(err) = self.client.connect().await {
            return SessionEnd::Failed(err);
        }

        if self.client.server_public_key() == Some(self.ignore_server_key) {
            info!("Relay is ourselves ({}); not watching", self.ignore_server_key.short_string());
            return SessionEnd::SelfConnect;
        }

        // Watcher clients subscribe on every connect; others need it here
        if !self.client.config().is_watcher {
            if let Err(err) = self.client.watch_connection_changes().await {
                return SessionEnd::Failed(err);
            }
        }

        self.state.send_replace(WatchState::Watching);
        backoff.reset();
        debug!("Watching relay (generation {})", self.client.generation());

        let period = self.config.status_interval();
        let mut status = interval_at(Instant::now() + period, period);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let received = tokio::select! {
                received = self.client.recv_detail() => received,
                _ = status.tick() => {
                    info!("{} peers", peers.len());
                    continue;
                }
            };

            let (msg, generation) = match received {
                Ok(received) => received,
                Err(err) => return SessionEnd::Failed(err),
            };

            if generation != *last_generation {
                if !peers.is_empty() {
                    info!(
                        "Connection changed (generation {} -> {}), dropping {} peers",
                        last_generation,
                        generation,
                        peers.len()
                    );
                }
                peers.clear(&self.handler);
                *last_generation = generation;
            }

            match msg {
                Message::PeerPresent { key, addr, .. } => {
                    peers.add(key, addr, &self.handler);
                }
                Message::PeerGone { key, reason } => {
                    match reason {
                        PeerGoneReason::Disconnected => {}
                        PeerGoneReason::NotHere => {
                            debug!("Peer {} not at relay", key.short_string())
                        }
                        PeerGoneReason::Unknown(code) => {
                            debug!("Peer {} gone, reason {}", key.short_string(), code)
                        }
                    }
                    peers.remove(&key, &self.handler);
                }
                Message::Ping(nonce) => {
                    if let Err(err) = self.client.send_pong(nonce).await {
                        return SessionEnd::Failed(err);
                    }
                }
                Message::Health { problem: Some(problem) } => {
                    warn!("Relay health: {}", problem);
                }
                Message::Restarting { reconnect_in, .. } => {
                    info!("Relay restarting, reconnect in {:?}", reconnect_in);
                }
                _ => {}
            }
        }
    }
}

/// Watch `client`'s relay, calling `on_add` / `on_remove` as peers come
/// and go. See [`WatchLoop::run`] for when it returns.
pub async fn run_watch_connection_loop<A, R, S>(
    client: Arc<Client>,
    ignore_server_key: NodePublic,
    shutdown: S,
    on_add: A,
    on_remove: R,
) -> WatchExit
where
    A: Fn(NodePublic, Option<SocketAddr>) + Send + Sync,
    R: Fn(NodePublic) + Send + Sync,
    S: Future<Output = ()>,
{
    WatchLoop::new(
        client,
        ignore_server_key,
        FnPresenceHandler::new(on_add, on_remove),
    )
    .run(shutdown)
    .await
}
