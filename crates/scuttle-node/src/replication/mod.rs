//! Feed replication with connected peers.
//!
//! Two protocols are spoken. Epidemic broadcast trees (`ebt.replicate`) is
//! tried first on connections we dialed; when the remote does not support
//! it, or the session fails, the peer is replicated feed by feed with
//! `createHistoryStream`. Incoming messages are verified and handed to the
//! [`MessageBuffer`]; outgoing ones are read from the feed store.

pub mod classic;
pub mod ebt;
pub mod history;
pub mod scheduler;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use scuttle_net::{Body, BodyType, Mux, Peer, ProcedureName, PubSub};
use scuttle_shared::message::verify_message;
use scuttle_shared::{FeedRef, Message, MessageHmac, RawMessage};
use scuttle_store::{Database, Hops};

use crate::buffer::MessageBuffer;
use crate::error::Result;

pub use ebt::{EbtReplicateHandler, Note};
pub use history::{CreateHistoryStreamHandler, HistoryArgs};
pub use scheduler::FeedScheduler;

/// Time an inbound peer gets to open an EBT session before we fall back to
/// `createHistoryStream`.
const EBT_GRACE: Duration = Duration::from_secs(3);

/// Messages read from the store per page when streaming a feed.
const PAGE_SIZE: usize = 100;

pub struct FeedReplicator {
    db: Arc<Database>,
    local: FeedRef,
    hops: Hops,
    hmac: MessageHmac,
    buffer: Arc<MessageBuffer>,
    messages: Arc<PubSub<Message>>,
    /// Connections currently served by an inbound EBT session.
    ebt_sessions: Mutex<HashSet<u64>>,
}

impl FeedReplicator {
    pub fn new(
        db: Arc<Database>,
        local: FeedRef,
        hops: Hops,
        hmac: MessageHmac,
        buffer: Arc<MessageBuffer>,
        messages: Arc<PubSub<Message>>,
    ) -> Self {
        Self {
            db,
            local,
            hops,
            hmac,
            buffer,
            messages,
            ebt_sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Register the procedures remote peers call to replicate from us.
    pub fn register(self: &Arc<Self>, mux: &Mux) {
        mux.add_handler(
            ProcedureName::new(&["createHistoryStream"]),
            Arc::new(CreateHistoryStreamHandler::new(self.clone())),
        );
        mux.add_closing_handler(
            ProcedureName::new(&["ebt", "replicate"]),
            Arc::new(EbtReplicateHandler::new(self.clone())),
        );
    }

    fn ebt_sessions(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.ebt_sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn has_ebt_session(&self, conn_id: u64) -> bool {
        self.ebt_sessions().contains(&conn_id)
    }

    /// Replicate feeds with `peer` until its connection closes.
    pub async fn replicate(&self, peer: &Peer) {
        let cancel = peer.conn().context();

        if !peer.conn().was_initiated_by_remote() {
            match self.run_ebt_client(peer, &cancel).await {
                Ok(()) => {
                    cancel.cancelled().await;
                    return;
                }
                Err(e) if cancel.is_cancelled() || e.is_connection_closed() => return,
                Err(e) => debug!(
                    peer = %peer.identity(),
                    error = %e,
                    "EBT unavailable, falling back to createHistoryStream"
                ),
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(EBT_GRACE) => {}
            }
            if self.has_ebt_session(peer.conn().id()) {
                // The session handler falls back on its own if EBT fails.
                cancel.cancelled().await;
                return;
            }
        }

        self.replicate_classic(peer, &cancel).await;
    }

    /// Feeds we replicate: the social graph within our hops plus the feed
    /// want list.
    pub fn wanted_feeds(&self) -> Result<Vec<FeedRef>> {
        Ok(self.db.view(|tx| {
            let graph = tx.graph.get_social_graph(&self.local, self.hops)?;
            let mut feeds: Vec<FeedRef> = graph.list().into_iter().map(|(f, _)| f).collect();
            for entry in tx.feed_want_list.list()? {
                if !graph.contains(&entry.reference) {
                    feeds.push(entry.reference);
                }
            }
            Ok(feeds)
        })?)
    }

    /// Highest sequence we hold of `feed`, counting contiguous buffered
    /// messages.
    pub fn local_sequence(&self, feed: &FeedRef) -> Result<u64> {
        let stored = self
            .db
            .view(|tx| tx.feeds.tip(feed))?
            .map_or(0, |t| t.sequence);
        Ok(self.buffer.contiguous_sequence(feed, stored))
    }

    /// Highest stored sequence of `feed`, ignoring the buffer.
    fn local_stored_sequence(&self, feed: &FeedRef) -> Result<u64> {
        Ok(self
            .db
            .view(|tx| tx.feeds.tip(feed))?
            .map_or(0, |t| t.sequence))
    }

    /// Stored messages of `feed` from `from` on, at most `limit`.
    fn stored_messages(&self, feed: &FeedRef, from: u64, limit: usize) -> Result<Vec<Message>> {
        Ok(self
            .db
            .view(|tx| tx.feeds.get_messages(feed, Some(from), Some(limit)))?)
    }

    /// Verify a message received from a peer.
    fn verify(&self, body: Vec<u8>) -> Result<Message> {
        Ok(verify_message(&RawMessage::new(body), &self.hmac)?)
    }
}

/// A message as sent on the wire: its signed JSON.
fn message_body(message: &Message) -> Body {
    Body {
        body_type: BodyType::Json,
        bytes: message.raw.as_bytes().to_vec(),
    }
}
