//! Feed-by-feed replication with `createHistoryStream`.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use scuttle_net::{Peer, ProcedureType, Request, RpcError};
use scuttle_shared::FeedRef;

use super::{FeedReplicator, FeedScheduler};
use crate::error::{NodeError, Result};

/// Messages requested per history stream.
const HISTORY_BATCH: usize = 500;
/// Pause once every candidate came back empty.
const IDLE_DELAY: Duration = Duration::from_secs(5);
/// Pause after a stream failed with a protocol error.
const BACKOFF: Duration = Duration::from_secs(2);

impl FeedReplicator {
    /// Rotate through the wanted feeds, fetching each one's new messages
    /// from `peer`, until `cancel` fires.
    pub async fn replicate_classic(&self, peer: &Peer, cancel: &CancellationToken) {
        debug!(peer = %peer.identity(), "replicating with createHistoryStream");
        let mut scheduler = FeedScheduler::new();
        let mut empty_streak = 0usize;

        while !cancel.is_cancelled() {
            let candidates = match self.wanted_feeds() {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(error = %e, "listing feeds to replicate failed");
                    Vec::new()
                }
            };

            let pause = match scheduler.next(&candidates, Instant::now()) {
                None => Some(IDLE_DELAY),
                Some(feed) => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.fetch_feed(peer, &feed) => result,
                    };
                    match result {
                        Ok(0) => {
                            empty_streak += 1;
                            (empty_streak >= candidates.len()).then_some(IDLE_DELAY)
                        }
                        Ok(received) => {
                            debug!(peer = %peer.identity(), feed = %feed, received, "fetched messages");
                            empty_streak = 0;
                            None
                        }
                        Err(e) if e.is_connection_closed() => break,
                        Err(e) => {
                            debug!(peer = %peer.identity(), feed = %feed, error = %e, "history stream failed");
                            Some(BACKOFF)
                        }
                    }
                }
            };

            if let Some(pause) = pause {
                empty_streak = 0;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    /// Fetch the messages of `feed` following what we hold. Returns how many
    /// arrived.
    pub async fn fetch_feed(&self, peer: &Peer, feed: &FeedRef) -> Result<usize> {
        let from = self.local_sequence(feed)? + 1;
        let request = Request::new(
            &["createHistoryStream"],
            ProcedureType::Source,
            json!([{
                "id": feed,
                "seq": from,
                "live": false,
                "old": true,
                "keys": false,
                "limit": HISTORY_BATCH,
            }]),
        );
        trace!(peer = %peer.identity(), feed = %feed, from, "requesting history");

        let mut stream = peer.conn().perform_request(request).await?;
        let mut received = 0;
        while let Some(item) = stream.next().await {
            let message = self.verify(item?.into_bytes())?;
            if message.feed != *feed {
                return Err(NodeError::Rpc(RpcError::Protocol(format!(
                    "history of {feed} contained a message of {}",
                    message.feed
                ))));
            }
            self.buffer.handle(message);
            received += 1;
        }
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::buffer::{BufferConfig, MessageBuffer};
    use crate::replication::testing::{peer_pair, publish_posts};
    use scuttle_net::{Mux, PubSub};
    use scuttle_shared::{Identity, MessageHmac};
    use scuttle_store::Database;

    fn replicator(db: &Arc<Database>, local: &Identity) -> Arc<FeedReplicator> {
        let messages = Arc::new(PubSub::new("messages"));
        let buffer = Arc::new(MessageBuffer::new(
            db.clone(),
            local.feed(),
            2,
            BufferConfig::default(),
            messages.clone(),
        ));
        Arc::new(FeedReplicator::new(
            db.clone(),
            local.feed(),
            2,
            MessageHmac::none(),
            buffer,
            messages,
        ))
    }

    #[tokio::test]
    async fn test_fetch_feed_from_peer() {
        let root = CancellationToken::new();
        let author = Identity::generate();

        let server_db = Arc::new(Database::open_in_memory().unwrap());
        publish_posts(&server_db, &author, 3);
        let server_identity = Identity::generate();
        let server = replicator(&server_db, &server_identity);
        let server_mux = Arc::new(Mux::new());
        server.register(&server_mux);

        let client_db = Arc::new(Database::open_in_memory().unwrap());
        let client_identity = Identity::generate();
        let client = replicator(&client_db, &client_identity);
        client_db
            .transact(|tx| {
                tx.feed_want_list
                    .add(&author.feed(), Utc::now() + chrono::Duration::hours(1))
            })
            .unwrap();
        assert_eq!(client.wanted_feeds().unwrap().len(), 2);

        let (peer, _) = peer_pair(
            (client_identity, Arc::new(Mux::new())),
            (server_identity, server_mux),
            &root,
        )
        .await;

        assert_eq!(client.fetch_feed(&peer, &author.feed()).await.unwrap(), 3);
        // Everything is buffered, so the next request starts after it.
        assert_eq!(client.local_sequence(&author.feed()).unwrap(), 3);
        assert_eq!(client.fetch_feed(&peer, &author.feed()).await.unwrap(), 0);

        assert_eq!(client.buffer.persist().unwrap(), 3);
        let tip = client_db.view(|tx| tx.feeds.tip(&author.feed())).unwrap().unwrap();
        assert_eq!(tip.sequence, 3);
        root.cancel();
    }
}
