//! Commands and queries offered to whoever embeds the node.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use scuttle_net::{parse_beacon, Origin, PeerManager, PubSub};
use scuttle_shared::message::Contact;
use scuttle_shared::{
    BanHash, BlobRef, FeedRef, Identity, Invite, Message, MessageHmac, MessageRef, PublicIdentity,
};
use scuttle_store::{Database, Hops, ReceivedMessage, SocialGraph, StoreError, WantListEntry};

use crate::blobs::BlobReplicator;
use crate::error::{NodeError, Result};
use crate::invite;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub identity: PublicIdentity,
    pub inbound: bool,
    pub address: Option<String>,
    /// Unix epoch millis.
    pub connected_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub feed: FeedRef,
    pub feed_count: u64,
    pub message_count: u64,
    pub peers: Vec<PeerStatus>,
}

#[derive(Clone)]
pub struct App {
    pub identity: Identity,
    pub hmac: MessageHmac,
    pub hops: Hops,
    pub db: Arc<Database>,
    pub messages: Arc<PubSub<Message>>,
    pub blobs: Arc<BlobReplicator>,
    pub peers: PeerManager,
}

impl App {
    pub fn local_feed(&self) -> FeedRef {
        self.identity.feed()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Sign `content` as the next message of the local feed.
    pub fn publish_raw(&self, content: &Value) -> Result<MessageRef> {
        if content.get("type").and_then(Value::as_str).is_none() {
            return Err(NodeError::InvalidArgument(
                "content must be an object with a string type".to_string(),
            ));
        }

        let local = self.local_feed();
        let appended = self.db.transact(|tx| {
            tx.feeds.update_feed(&local, |feed| {
                feed.create_message(&self.identity, &self.hmac, Utc::now(), content)?;
                Ok(())
            })
        })?;

        let mut id = None;
        for message in appended {
            id = Some(message.id);
            self.messages.publish(message);
        }
        let id = id.ok_or_else(|| {
            NodeError::Store(StoreError::Invariant("nothing was appended".to_string()))
        })?;
        debug!(message = %id, "published");
        Ok(id)
    }

    pub fn follow(&self, target: &FeedRef) -> Result<MessageRef> {
        self.publish_raw(&Contact::follow(*target).to_content())
    }

    pub fn block(&self, target: &FeedRef) -> Result<MessageRef> {
        self.publish_raw(&Contact::block(*target).to_content())
    }

    /// Ban `hash`, deleting the feed behind it if we know it and dropping
    /// its connection.
    pub fn add_to_ban_list(&self, hash: &BanHash) -> Result<()> {
        self.db.transact(|tx| tx.ban_list.add(hash))?;
        for peer in self.peers.peers() {
            if BanHash::of_feed(&FeedRef::from(*peer.identity())) == *hash {
                info!(peer = %peer.identity(), "disconnecting banned peer");
                peer.conn().close();
            }
        }
        Ok(())
    }

    pub fn remove_from_ban_list(&self, hash: &BanHash) -> Result<()> {
        Ok(self.db.transact(|tx| tx.ban_list.remove(hash))?)
    }

    /// Replicate `feed` until `until` even if it is outside the graph.
    pub fn want_feed(&self, feed: &FeedRef, until: DateTime<Utc>) -> Result<()> {
        Ok(self.db.transact(|tx| tx.feed_want_list.add(feed, until))?)
    }

    pub async fn download_blob(&self, blob: &BlobRef, until: DateTime<Utc>) -> Result<()> {
        self.blobs.want(blob, until).await
    }

    pub async fn create_blob(&self, data: &[u8]) -> Result<BlobRef> {
        self.blobs.create(data).await
    }

    /// Redeem `invite` and follow the pub that accepted it.
    pub async fn redeem_invite(&self, invite: &Invite) -> Result<MessageRef> {
        invite::redeem_invite(self.peers.transport(), invite, &self.local_feed()).await?;
        self.follow(&FeedRef::from(invite.remote))
    }

    pub async fn connect(&self, identity: &PublicIdentity, address: &str) -> Result<()> {
        Ok(self.peers.connect(identity, address).await?)
    }

    pub async fn connect_via_room(
        &self,
        portal: &PublicIdentity,
        target: &PublicIdentity,
    ) -> Result<()> {
        Ok(self.peers.connect_via_room(portal, target).await?)
    }

    pub fn process_new_local_discovery(&self, identity: PublicIdentity, address: String) {
        self.peers.process_new_local_discovery(identity, address);
    }

    /// Feed every address of a local discovery beacon to the peer manager.
    pub fn process_beacon(&self, beacon: &str) {
        for address in parse_beacon(beacon) {
            self.process_new_local_discovery(address.key, address.host_port());
        }
    }

    pub fn disconnect_all(&self) {
        self.peers.disconnect_all();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Result<Status> {
        let (feed_count, message_count) = self
            .db
            .view(|tx| Ok((tx.feeds.count()?, tx.messages.count()?)))?;
        let mut peers: Vec<PeerStatus> = self
            .peers
            .connections()
            .into_iter()
            .map(|info| PeerStatus {
                identity: *info.peer.identity(),
                inbound: info.origin == Origin::Inbound,
                address: info.address,
                connected_at: info.connected_at,
            })
            .collect();
        peers.sort_by_key(|p| p.connected_at);

        Ok(Status {
            feed: self.local_feed(),
            feed_count,
            message_count,
            peers,
        })
    }

    pub fn receive_log(&self, start: u64, limit: usize) -> Result<Vec<ReceivedMessage>> {
        Ok(self.db.view(|tx| tx.receive_log.list(start, limit))?)
    }

    pub fn feed_messages(
        &self,
        feed: &FeedRef,
        from: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        Ok(self.db.view(|tx| tx.feeds.get_messages(feed, from, limit))?)
    }

    pub fn get_message(&self, id: &MessageRef) -> Result<Message> {
        Ok(self.db.view(|tx| tx.messages.get(id))?)
    }

    pub fn ban_list(&self) -> Result<Vec<BanHash>> {
        Ok(self.db.view(|tx| tx.ban_list.list())?)
    }

    pub fn blob_want_list(&self) -> Result<Vec<WantListEntry<BlobRef>>> {
        // Expired entries are pruned on read, hence the write transaction.
        Ok(self.db.transact(|tx| tx.blob_want_list.list())?)
    }

    pub fn feed_want_list(&self) -> Result<Vec<WantListEntry<FeedRef>>> {
        Ok(self.db.transact(|tx| tx.feed_want_list.list())?)
    }

    pub async fn get_blob(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        match self.blobs.storage().get(blob).await {
            Ok(data) => Ok(data),
            Err(StoreError::NotFound) => Err(NodeError::BlobNotFound(*blob)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn social_graph(&self) -> Result<SocialGraph> {
        let local = self.local_feed();
        Ok(self
            .db
            .view(|tx| tx.graph.get_social_graph(&local, self.hops))?)
    }
}
