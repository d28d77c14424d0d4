mod common;

use common::{relay_url, TestRelay};
use derp_client::{
    run_watch_connection_loop, BackoffConfig, Client, ClientConfig, PresenceHandler, WatchExit,
    WatchLoop, WatchLoopConfig, WatchState,
};
use derp_wire::{NodePrivate, NodePublic};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Tracks the present set and counts add/remove calls that break
/// alternation
#[derive(Default)]
struct PeerSet {
    present: Mutex<HashSet<NodePublic>>,
    violations: Mutex<Vec<String>>,
}

impl PeerSet {
    fn len(&self) -> usize {
        self.present.lock().unwrap().len()
    }

    fn contains(&self, key: &NodePublic) -> bool {
        self.present.lock().unwrap().contains(key)
    }
}

impl PresenceHandler for PeerSet {
    fn peer_added(&self, key: NodePublic, _addr: Option<SocketAddr>) {
        if !self.present.lock().unwrap().insert(key) {
            self.violations
                .lock()
                .unwrap()
                .push(format!("double add {:?}", key));
        }
    }

    fn peer_removed(&self, key: NodePublic) {
        if !self.present.lock().unwrap().remove(&key) {
            self.violations
                .lock()
                .unwrap()
                .push(format!("remove without add {:?}", key));
        }
    }
}

fn fast_config() -> WatchLoopConfig {
    WatchLoopConfig {
        backoff: BackoffConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            multiplier: 2.0,
            jitter: 0.1,
        },
        status_interval_ms: 50,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_watch_survives_repeated_breaks() {
    let relay = TestRelay::with_mesh_key("1234");
    let peer_key = NodePrivate::generate();
    let peer = relay.client(peer_key.clone());
    peer.connect().await.unwrap();

    let watcher_key = NodePrivate::generate();
    let watcher = relay.watcher(watcher_key.clone(), "1234");
    let peers = Arc::new(PeerSet::default());

    let watch = WatchLoop::new(watcher.clone(), NodePrivate::generate().public(), peers.clone())
        .with_config(fast_config());
    let mut state = watch.subscribe_state();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(watch.run(async {
        let _ = stop_rx.await;
    }));

    // The relay reports every client, the watcher included
    wait_until("initial peers", || peers.len() == 2).await;
    assert!(peers.contains(&peer_key.public()));
    state.wait_for(|s| *s == WatchState::Watching).await.unwrap();

    for _ in 0..10 {
        let generation = watcher.generation();
        assert!(watcher.invalidate(generation).await);
        wait_until("reconnect", || {
            watcher.generation() > generation && peers.len() == 2
        })
        .await;
    }

    assert_eq!(peers.len(), 2);
    assert!(peers.violations.lock().unwrap().is_empty());
    assert!(watcher.generation() >= 11);

    stop_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), WatchExit::Shutdown);
    assert_eq!(peers.len(), 0);
    assert!(peers.violations.lock().unwrap().is_empty());
    assert_eq!(*state.borrow(), WatchState::Disconnected);
}

#[tokio::test]
async fn test_watch_tracks_arrivals_and_departures() {
    let relay = TestRelay::with_mesh_key("1234");
    let watcher = relay.watcher(NodePrivate::generate(), "1234");
    let peers = Arc::new(PeerSet::default());

    let watch = WatchLoop::new(watcher.clone(), NodePrivate::generate().public(), peers.clone())
        .with_config(fast_config());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(watch.run(async {
        let _ = stop_rx.await;
    }));
    wait_until("watcher sees itself", || peers.len() == 1).await;

    let late_key = NodePrivate::generate();
    let late = relay.client(late_key.clone());
    late.connect().await.unwrap();
    wait_until("late peer added", || peers.contains(&late_key.public())).await;

    late.close().await.unwrap();
    wait_until("late peer removed", || !peers.contains(&late_key.public())).await;

    // A relay-side drop of the peer is reported the same way
    let other_key = NodePrivate::generate();
    let other = relay.client(other_key.clone());
    other.connect().await.unwrap();
    wait_until("other peer added", || peers.contains(&other_key.public())).await;
    assert!(relay.kick(&other_key.public()));
    wait_until("other peer removed", || !peers.contains(&other_key.public())).await;

    assert!(peers.violations.lock().unwrap().is_empty());
    stop_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), WatchExit::Shutdown);
}

#[tokio::test]
async fn test_watch_recovers_from_relay_drop() {
    let relay = TestRelay::with_mesh_key("1234");
    let peer = relay.client(NodePrivate::generate());
    peer.connect().await.unwrap();

    let watcher_key = NodePrivate::generate();
    let watcher = relay.watcher(watcher_key.clone(), "1234");
    let peers = Arc::new(PeerSet::default());
    let watch = WatchLoop::new(watcher.clone(), NodePrivate::generate().public(), peers.clone())
        .with_config(fast_config());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(watch.run(async {
        let _ = stop_rx.await;
    }));

    wait_until("initial peers", || peers.len() == 2).await;
    let generation = watcher.generation();
    assert!(relay.kick(&watcher_key.public()));
    wait_until("reconnect", || {
        watcher.generation() > generation && peers.len() == 2
    })
    .await;

    assert!(peers.violations.lock().unwrap().is_empty());
    stop_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), WatchExit::Shutdown);
}

#[tokio::test]
async fn test_watch_stops_on_rejected_mesh_key() {
    let relay = TestRelay::with_mesh_key("1234");
    let watcher = relay.watcher(NodePrivate::generate(), "not-the-key");

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        run_watch_connection_loop(
            watcher,
            NodePrivate::generate().public(),
            std::future::pending(),
            |_, _| panic!("no peers expected"),
            |_| panic!("no peers expected"),
        ),
    )
    .await
    .unwrap();

    assert!(matches!(exit, WatchExit::Rejected(_)));
    assert_eq!(relay.dial_count(), 1);
}

#[tokio::test]
async fn test_watch_stops_on_self_connect() {
    let relay_key = NodePrivate::generate();
    let relay = TestRelay::with_key(relay_key.clone(), Some("1234"));
    let watcher = relay.watcher(NodePrivate::generate(), "1234");

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        run_watch_connection_loop(
            watcher,
            relay_key.public(),
            std::future::pending(),
            |_, _| {},
            |_| {},
        ),
    )
    .await
    .unwrap();

    assert_eq!(exit, WatchExit::SelfConnect);
}

#[tokio::test]
async fn test_watch_stops_when_client_closes() {
    let relay = TestRelay::with_mesh_key("1234");
    let watcher = relay.watcher(NodePrivate::generate(), "1234");
    let peers = Arc::new(PeerSet::default());
    let watch = WatchLoop::new(watcher.clone(), NodePrivate::generate().public(), peers.clone())
        .with_config(fast_config());
    let task = tokio::spawn(watch.run(std::future::pending()));

    wait_until("watcher sees itself", || peers.len() == 1).await;
    watcher.close().await.unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, WatchExit::ClientClosed);
    assert_eq!(peers.len(), 0);
    assert!(peers.violations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_backoff_resets_once_watching() {
    let relay = TestRelay::new();
    relay.set_dial_delay(Duration::from_secs(3600));
    // Not a mesh watcher: the relay sends this client no presence traffic
    let config = ClientConfig::new(NodePrivate::generate(), relay_url())
        .with_connect_timeout(Duration::from_millis(20));
    let client = Arc::new(Client::new(config, relay.dialer()));

    let watch_config = WatchLoopConfig {
        backoff: BackoffConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 60_000,
            multiplier: 10.0,
            jitter: 0.0,
        },
        status_interval_ms: 10_000,
    };
    let peers = Arc::new(PeerSet::default());
    let watch = WatchLoop::new(client.clone(), NodePrivate::generate().public(), peers.clone())
        .with_config(watch_config);
    let mut state = watch.subscribe_state();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(watch.run(async {
        let _ = stop_rx.await;
    }));

    // Three timed-out dials escalate the delay to 10ms, 100ms, then 1s
    wait_until("three failed dials", || relay.dial_count() >= 3).await;
    relay.set_dial_delay(Duration::ZERO);
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == WatchState::Watching))
        .await
        .unwrap()
        .unwrap();

    // Without a reset the next delay would be 10s
    let generation = client.generation();
    assert!(client.invalidate(generation).await);
    wait_until("quick reconnect", || client.generation() > generation).await;

    assert_eq!(peers.len(), 0);
    stop_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), WatchExit::Shutdown);
}
