//! Peer connection tracking.
//!
//! Maintains an in-memory map of connected peers keyed by identity, with
//! the direction of each connection and where it was reached.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use scuttle_shared::PublicIdentity;

use crate::peer::Peer;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: Peer,
    pub origin: Origin,
    /// Address or room through which the peer was reached, if we dialed.
    pub address: Option<String>,
    /// Unix epoch millis.
    pub connected_at: i64,
}

/// Tracks all currently connected peers, at most one connection each.
#[derive(Debug, Default)]
pub struct PeerTracker {
    peers: HashMap<PublicIdentity, ConnectionInfo>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly connected peer. Returns the connection it replaces.
    pub fn on_connected(
        &mut self,
        peer: Peer,
        origin: Origin,
        address: Option<String>,
    ) -> Option<ConnectionInfo> {
        debug!(
            peer = %peer.identity(),
            id = peer.conn().id(),
            origin = ?origin,
            addr = ?address,
            "Tracking new peer connection"
        );
        let identity = *peer.identity();
        self.peers.insert(
            identity,
            ConnectionInfo {
                peer,
                origin,
                address,
                connected_at: Utc::now().timestamp_millis(),
            },
        )
    }

    /// Forget `identity` if it is still tracked with connection `conn_id`.
    pub fn on_disconnected(&mut self, identity: &PublicIdentity, conn_id: u64) -> bool {
        let current = self.peers.get(identity).map(|info| info.peer.conn().id());
        if current == Some(conn_id) {
            self.peers.remove(identity);
            debug!(peer = %identity, "Removed peer from tracker");
            true
        } else {
            false
        }
    }

    pub fn get(&self, identity: &PublicIdentity) -> Option<&ConnectionInfo> {
        self.peers.get(identity)
    }

    pub fn is_connected(&self, identity: &PublicIdentity) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers.values().map(|info| info.peer.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn count(&self, origin: Origin) -> usize {
        self.peers.values().filter(|info| info.origin == origin).count()
    }

    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        self.peers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mux::Mux;
    use crate::rpc::testing::connected_pair;

    async fn peer() -> Peer {
        let (client, _server) = connected_pair(Arc::new(Mux::new()), Arc::new(Mux::new())).await;
        Peer::new(client)
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let mut tracker = PeerTracker::new();
        let p = peer().await;
        let identity = *p.identity();
        let conn_id = p.conn().id();

        assert!(!tracker.is_connected(&identity));
        assert!(tracker.on_connected(p, Origin::Outbound, None).is_none());
        assert!(tracker.is_connected(&identity));
        assert_eq!(tracker.count(Origin::Outbound), 1);
        assert_eq!(tracker.count(Origin::Inbound), 0);

        assert!(!tracker.on_disconnected(&identity, conn_id + 1000));
        assert!(tracker.on_disconnected(&identity, conn_id));
        assert_eq!(tracker.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_newer_connection_replaces_older() {
        let mut tracker = PeerTracker::new();
        let first = peer().await;
        let identity = *first.identity();
        let first_id = first.conn().id();
        // Same remote identity, different connection.
        let second = Peer::new(first.conn().clone());
        tracker.on_connected(first, Origin::Inbound, None);

        let replaced = tracker
            .on_connected(second, Origin::Outbound, Some("a:1".to_string()))
            .unwrap();
        assert_eq!(replaced.peer.conn().id(), first_id);
        assert_eq!(tracker.get(&identity).unwrap().origin, Origin::Outbound);
        assert_eq!(tracker.peer_count(), 1);
    }
}
