//! Peer directory across watched relays.

use dashmap::DashMap;
use derp_client::PresenceHandler;
use derp_wire::NodePublic;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{component_debug, component_info};

/// Which relays currently report each peer
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<NodePublic, BTreeSet<String>>,
}

impl PeerDirectory {
    /// Record `peer` on `relay`. Returns true if the peer was not known on
    /// any relay before.
    pub fn add(&self, peer: NodePublic, relay: &str) -> bool {
        let mut relays = self.peers.entry(peer).or_default();
        let first = relays.is_empty();
        relays.insert(relay.to_string());
        first
    }

    /// Forget `peer` on `relay`. Returns true if no relay reports it
    /// anymore.
    pub fn remove(&self, peer: &NodePublic, relay: &str) -> bool {
        let now_empty = match self.peers.get_mut(peer) {
            Some(mut relays) => {
                relays.remove(relay);
                relays.is_empty()
            }
            None => return false,
        };
        if now_empty {
            self.peers.remove_if(peer, |_, relays| relays.is_empty());
        }
        now_empty
    }

    /// Relays reporting `peer`, sorted
    pub fn relays_for(&self, peer: &NodePublic) -> Vec<String> {
        self.peers
            .get(peer)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Feeds one relay's presence events into a shared [`PeerDirectory`]
pub struct RelayPresence {
    relay: String,
    directory: Arc<PeerDirectory>,
}

impl RelayPresence {
    pub fn new(relay: impl Into<String>, directory: Arc<PeerDirectory>) -> Self {
        Self {
            relay: relay.into(),
            directory,
        }
    }
}

impl PresenceHandler for RelayPresence {
    fn peer_added(&self, key: NodePublic, addr: Option<SocketAddr>) {
        if self.directory.add(key, &self.relay) {
            component_info!("directory", "+ {} via {} ({:?})", key, self.relay, addr);
        } else {
            component_debug!("directory", "{} also on {}", key.short_string(), self.relay);
        }
    }

    fn peer_removed(&self, key: NodePublic) {
        if self.directory.remove(&key, &self.relay) {
            component_info!("directory", "- {} (last seen on {})", key, self.relay);
        } else {
            component_debug!("directory", "{} left {}", key.short_string(), self.relay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use derp_wire::NodePrivate;

    #[test]
    fn test_peer_tracked_across_relays() {
        let directory = PeerDirectory::default();
        let peer = NodePrivate::generate().public();

        assert!(directory.add(peer, "http://b.example:80/derp"));
        assert!(!directory.add(peer, "http://a.example:80/derp"));
        assert_eq!(
            directory.relays_for(&peer),
            vec!["http://a.example:80/derp", "http://b.example:80/derp"]
        );

        assert!(!directory.remove(&peer, "http://a.example:80/derp"));
        assert_eq!(directory.len(), 1);
        assert!(directory.remove(&peer, "http://b.example:80/derp"));
        assert_eq!(directory.len(), 0);
        assert!(directory.relays_for(&peer).is_empty());
    }

    #[test]
    fn test_remove_unknown_peer() {
        let directory = PeerDirectory::default();
        assert!(!directory.remove(&NodePrivate::generate().public(), "http://a.example:80/derp"));
    }

    #[test]
    fn test_relay_presence_handler() {
        let directory = Arc::new(PeerDirectory::default());
        let handler = RelayPresence::new("http://a.example:80/derp", directory.clone());
        let peer = NodePrivate::generate().public();

        handler.peer_added(peer, None);
        assert_eq!(directory.len(), 1);
        handler.peer_removed(peer);
        assert_eq!(directory.len(), 0);
    }
}
