//! Admission, supervision and (re)connection of peers.
//!
//! The manager runs as one task fed by a channel of accepted peers, in the
//! same command/event loop style as the rest of the networking layer.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scuttle_shared::PublicIdentity;

use crate::discovery::DiscoveryCache;
use crate::error::{NetError, Result};
use crate::peer::Peer;
use crate::peers::{ConnectionInfo, Origin, PeerTracker};
use crate::pubsub::PubSub;
use crate::rooms::{self, AttendantEvent, RoomAttendantEvent};
use crate::transport::Transport;

const DISCOVERY_DEBOUNCE: Duration = Duration::from_secs(10);
const DISCOVERY_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const ESTABLISH_EVERY: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredPub {
    pub identity: PublicIdentity,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub preferred_pubs: Vec<PreferredPub>,
    pub max_inbound: usize,
    pub max_outbound: usize,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            preferred_pubs: Vec::new(),
            max_inbound: 20,
            max_outbound: 10,
        }
    }
}

/// Work done for every connected peer until its connection closes.
#[async_trait]
pub trait PeerSupervisor: Send + Sync {
    async fn run(&self, peer: Peer);
}

#[derive(Debug, Clone)]
enum Candidate {
    Direct(PublicIdentity, String),
    ViaRoom {
        portal: PublicIdentity,
        target: PublicIdentity,
    },
}

impl Candidate {
    fn identity(&self) -> &PublicIdentity {
        match self {
            Candidate::Direct(identity, _) => identity,
            Candidate::ViaRoom { target, .. } => target,
        }
    }
}

struct Inner {
    transport: Arc<Transport>,
    config: PeerManagerConfig,
    supervisor: Arc<dyn PeerSupervisor>,
    tracker: Mutex<PeerTracker>,
    discovery: Mutex<DiscoveryCache>,
    /// Attendants of each connected room, keyed by portal.
    rooms: Mutex<HashMap<PublicIdentity, BTreeSet<PublicIdentity>>>,
    new_peers: PubSub<Peer>,
    attendants: PubSub<RoomAttendantEvent>,
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    pub fn new(
        transport: Arc<Transport>,
        config: PeerManagerConfig,
        supervisor: Arc<dyn PeerSupervisor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                supervisor,
                tracker: Mutex::new(PeerTracker::new()),
                discovery: Mutex::new(DiscoveryCache::new(DISCOVERY_DEBOUNCE, DISCOVERY_EXPIRY)),
                rooms: Mutex::new(HashMap::new()),
                new_peers: PubSub::new("new_peers"),
                attendants: PubSub::new("room_attendants"),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.inner.transport
    }

    /// Every peer registered from now on.
    pub fn new_peers(&self) -> &PubSub<Peer> {
        &self.inner.new_peers
    }

    pub fn attendant_events(&self) -> &PubSub<RoomAttendantEvent> {
        &self.inner.attendants
    }

    fn tracker(&self) -> MutexGuard<'_, PeerTracker> {
        self.inner.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<PublicIdentity, BTreeSet<PublicIdentity>>> {
        self.inner.rooms.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.tracker().connected_peers()
    }

    pub fn peer_count(&self) -> usize {
        self.tracker().peer_count()
    }

    pub fn get(&self, identity: &PublicIdentity) -> Option<Peer> {
        self.tracker().get(identity).map(|info| info.peer.clone())
    }

    pub fn is_connected(&self, identity: &PublicIdentity) -> bool {
        self.tracker().is_connected(identity)
    }

    /// Connected peers with how and when they were reached.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.tracker().all_connections()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Register `peer`, replacing an older connection to the same identity,
    /// and start supervising it.
    pub fn accept(&self, peer: Peer, origin: Origin, address: Option<String>) -> Result<()> {
        if peer.identity() == &self.inner.transport.local() {
            peer.conn().close();
            return Err(NetError::Rejected("connection to self".to_string()));
        }

        let replaced = {
            let mut tracker = self.tracker();
            let replacing = tracker.is_connected(peer.identity());
            if origin == Origin::Inbound
                && !replacing
                && tracker.count(Origin::Inbound) >= self.inner.config.max_inbound
            {
                drop(tracker);
                peer.conn().close();
                return Err(NetError::Rejected("inbound slots full".to_string()));
            }
            tracker.on_connected(peer.clone(), origin, address)
        };

        if let Some(old) = replaced {
            debug!(peer = %peer.identity(), id = old.peer.conn().id(), "closing replaced connection");
            old.peer.conn().close();
        }

        info!(peer = %peer.identity(), origin = ?origin, "Peer connected");
        self.inner.new_peers.publish(peer.clone());
        tokio::spawn(self.clone().supervise(peer.clone()));
        tokio::spawn(self.clone().watch_room(peer));
        Ok(())
    }

    async fn supervise(self, peer: Peer) {
        let conn = peer.conn().clone();
        tokio::select! {
            _ = self.inner.supervisor.run(peer.clone()) => {}
            _ = conn.closed() => {}
        }
        conn.close();

        let removed = self.tracker().on_disconnected(peer.identity(), conn.id());
        if removed {
            self.rooms().remove(peer.identity());
            info!(peer = %peer.identity(), "Peer disconnected");
        }
    }

    /// Follow room attendants if `peer` turns out to be a room.
    async fn watch_room(self, peer: Peer) {
        let cancel = peer.conn().context();
        let Some(metadata) = rooms::room_metadata(peer.conn()).await else {
            return;
        };
        info!(portal = %peer.identity(), name = ?metadata.name, "connected to room");
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = rooms::follow_attendants(&peer, &self.inner.attendants) => {
                if let Err(e) = result {
                    debug!(portal = %peer.identity(), error = %e, "room attendants ended");
                }
            }
        }
    }

    fn apply_attendant_event(&self, event: &RoomAttendantEvent) {
        if !self.is_connected(&event.portal) {
            return;
        }
        let mut rooms = self.rooms();
        let attendants = rooms.entry(event.portal).or_default();
        match &event.event {
            AttendantEvent::State(ids) => {
                *attendants = ids.iter().copied().collect();
            }
            AttendantEvent::Joined(id) => {
                attendants.insert(*id);
            }
            AttendantEvent::Left(id) => {
                attendants.remove(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dialing
    // -----------------------------------------------------------------------

    fn outbound_slot_free(&self) -> bool {
        self.tracker().count(Origin::Outbound) < self.inner.config.max_outbound
    }

    /// Dial `identity` at `address` unless it is already connected.
    pub async fn connect(&self, identity: &PublicIdentity, address: &str) -> Result<()> {
        if self.is_connected(identity) {
            return Ok(());
        }
        if !self.outbound_slot_free() {
            return Err(NetError::Rejected("outbound slots full".to_string()));
        }
        let peer = self.inner.transport.dial(identity, address).await?;
        self.accept(peer, Origin::Outbound, Some(address.to_string()))
    }

    /// Reach `target` through a tunnel opened on the connected room `portal`.
    pub async fn connect_via_room(
        &self,
        portal: &PublicIdentity,
        target: &PublicIdentity,
    ) -> Result<()> {
        if self.is_connected(target) {
            return Ok(());
        }
        let portal_peer = self
            .get(portal)
            .ok_or_else(|| NetError::UnknownPeer(portal.to_string()))?;
        let tunnel = rooms::open_tunnel(&portal_peer, target).await?;
        let transport = &self.inner.transport;
        let peer = transport
            .upgrade_client(transport.identity(), tunnel, target)
            .await?;
        self.accept(peer, Origin::Outbound, Some(format!("room:{portal}")))
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .inner
            .config
            .preferred_pubs
            .iter()
            .map(|p| Candidate::Direct(p.identity, p.address.clone()))
            .collect();
        for (portal, attendants) in self.rooms().iter() {
            candidates.extend(attendants.iter().map(|target| Candidate::ViaRoom {
                portal: *portal,
                target: *target,
            }));
        }
        let discovered = self
            .inner
            .discovery
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .active(Instant::now());
        candidates.extend(
            discovered
                .into_iter()
                .map(|(identity, address)| Candidate::Direct(identity, address)),
        );
        candidates
    }

    /// Dial preferred pubs, room attendants and discovered peers that are
    /// not connected, within the free outbound slots.
    pub async fn establish_new_connections(&self) {
        let local = self.inner.transport.local();
        let free = {
            let tracker = self.tracker();
            self.inner
                .config
                .max_outbound
                .saturating_sub(tracker.count(Origin::Outbound))
        };
        if free == 0 {
            return;
        }

        let mut chosen = BTreeSet::new();
        let selected: Vec<Candidate> = self
            .candidates()
            .into_iter()
            .filter(|c| *c.identity() != local && !self.is_connected(c.identity()))
            .filter(|c| chosen.insert(*c.identity()))
            .take(free)
            .collect();
        if selected.is_empty() {
            return;
        }
        debug!(count = selected.len(), "establishing new connections");

        let attempts = selected.into_iter().map(|candidate| async move {
            let result = match &candidate {
                Candidate::Direct(identity, address) => self.connect(identity, address).await,
                Candidate::ViaRoom { portal, target } => {
                    self.connect_via_room(portal, target).await
                }
            };
            if let Err(e) = result {
                debug!(peer = %candidate.identity(), error = %e, "connection attempt failed");
            }
        });
        join_all(attempts).await;
    }

    /// A peer announced itself on the local network.
    pub fn process_new_local_discovery(&self, identity: PublicIdentity, address: String) {
        if identity == self.inner.transport.local() {
            return;
        }
        let act = self
            .inner
            .discovery
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .observe(identity, &address, Instant::now());
        if !act {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.connect(&identity, &address).await {
                debug!(peer = %identity, addr = %address, error = %e, "local peer unreachable");
            }
        });
    }

    pub fn disconnect_all(&self) {
        let peers = self.peers();
        info!(count = peers.len(), "disconnecting all peers");
        for peer in peers {
            peer.conn().close();
        }
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Accept inbound peers, track room attendants and periodically dial new
    /// peers until `cancel` fires, then disconnect everyone.
    pub async fn run(self, mut inbound: mpsc::Receiver<Peer>, cancel: CancellationToken) {
        let mut attendants = self.inner.attendants.subscribe();
        let mut ticker = tokio::time::interval(ESTABLISH_EVERY);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                peer = inbound.recv() => match peer {
                    Some(peer) => {
                        if let Err(e) = self.accept(peer, Origin::Inbound, None) {
                            warn!(error = %e, "inbound peer rejected");
                        }
                    }
                    None => {
                        info!("inbound channel closed, stopping peer manager");
                        break;
                    }
                },

                Some(event) = attendants.recv() => {
                    self.apply_attendant_event(&event);
                    if let AttendantEvent::Joined(target) = event.event {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.connect_via_room(&event.portal, &target).await {
                                debug!(peer = %target, error = %e, "room attendant unreachable");
                            }
                        });
                    }
                },

                _ = ticker.tick() => {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.establish_new_connections().await });
                },
            }
        }
        self.disconnect_all();
    }
}
