//! Serving `createHistoryStream` to peers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use scuttle_net::{Connection, Handler, IncomingRequest, RequestStream, ResponseWriter, RpcError};
use scuttle_shared::{FeedRef, Message};

use super::{message_body, FeedReplicator, PAGE_SIZE};
use crate::error::{NodeError, Result};

/// Arguments of a `createHistoryStream` call.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryArgs {
    pub id: FeedRef,
    /// First sequence to send; 0 and 1 both mean the start of the feed.
    #[serde(default)]
    pub seq: u64,
    /// Keep the stream open and send messages as they are persisted.
    #[serde(default)]
    pub live: bool,
    /// Send the messages already stored.
    #[serde(default = "default_true")]
    pub old: bool,
    /// Wrap messages in `{key, value, timestamp}`.
    #[serde(default = "default_true")]
    pub keys: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

pub struct CreateHistoryStreamHandler {
    replicator: Arc<FeedReplicator>,
}

impl CreateHistoryStreamHandler {
    pub fn new(replicator: Arc<FeedReplicator>) -> Self {
        Self { replicator }
    }
}

#[async_trait]
impl Handler for CreateHistoryStreamHandler {
    async fn handle(&self, conn: &Connection, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            mut stream,
            mut writer,
        } = incoming;

        let args: HistoryArgs = match serde_json::from_value(request.first_arg().clone()) {
            Ok(args) => args,
            Err(e) => {
                let _ = writer.end_with_error(&format!("invalid arguments: {e}")).await;
                return;
            }
        };
        debug!(peer = %conn.remote(), feed = %args.id, seq = args.seq, live = args.live, "serving history");

        match self
            .replicator
            .serve_history(&args, &mut stream, &mut writer)
            .await
        {
            Ok(()) => {
                let _ = writer.end().await;
            }
            Err(e) if e.is_connection_closed() => {}
            Err(e) => {
                debug!(peer = %conn.remote(), feed = %args.id, error = %e, "history stream failed");
                let _ = writer.end_with_error(&e.to_string()).await;
            }
        }
    }
}

impl FeedReplicator {
    /// Stream the messages `args` asks for into `writer`. Returns once the
    /// history is sent, or for live streams once the caller goes away.
    pub async fn serve_history(
        &self,
        args: &HistoryArgs,
        caller: &mut RequestStream,
        writer: &mut ResponseWriter,
    ) -> Result<()> {
        let cancel = writer.context();
        let limit = args.limit.unwrap_or(usize::MAX);
        let mut sent = 0usize;
        // Subscribe first so nothing persisted meanwhile is missed.
        let mut live = args.live.then(|| self.messages.subscribe());

        let mut next = args.seq.max(1);
        if args.old {
            while sent < limit {
                let page = PAGE_SIZE.min(limit - sent);
                let messages = self.stored_messages(&args.id, next, page)?;
                if messages.is_empty() {
                    break;
                }
                for message in &messages {
                    send(writer, message, args.keys).await?;
                    next = message.sequence + 1;
                    sent += 1;
                }
            }
        } else {
            next = self.local_stored_sequence(&args.id)?.max(next - 1) + 1;
        }

        let Some(live) = live.as_mut() else {
            return Ok(());
        };
        while sent < limit {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::Cancelled.into()),
                item = caller.next() => match item {
                    Some(Ok(_)) => {}
                    // The caller ended the stream.
                    _ => return Ok(()),
                },
                message = live.recv() => match message {
                    Some(message) if message.feed == args.id && message.sequence >= next => {
                        // Catch up on anything persisted before this one.
                        let count = (message.sequence - next + 1) as usize;
                        for message in self.stored_messages(&args.id, next, count.min(limit - sent))? {
                            send(writer, &message, args.keys).await?;
                            next = message.sequence + 1;
                            sent += 1;
                        }
                    }
                    Some(_) => {}
                    None => return Ok(()),
                },
            }
        }
        Ok(())
    }
}

async fn send(writer: &mut ResponseWriter, message: &Message, keys: bool) -> Result<()> {
    if keys {
        let value = message
            .to_keyed_value(message.timestamp)
            .map_err(NodeError::from)?;
        writer.send_json(&value).await?;
    } else {
        writer.send(message_body(message)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::buffer::{BufferConfig, MessageBuffer};
    use crate::replication::testing::{peer_pair, publish_posts};
    use scuttle_net::{Mux, ProcedureType, PubSub, Request};
    use scuttle_shared::{Identity, MessageHmac};
    use scuttle_store::Database;

    struct Server {
        db: Arc<Database>,
        buffer: Arc<MessageBuffer>,
        mux: Arc<Mux>,
    }

    fn server(identity: &Identity) -> Server {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let messages = Arc::new(PubSub::new("messages"));
        let buffer = Arc::new(MessageBuffer::new(
            db.clone(),
            identity.feed(),
            2,
            BufferConfig::default(),
            messages.clone(),
        ));
        let replicator = Arc::new(FeedReplicator::new(
            db.clone(),
            identity.feed(),
            2,
            MessageHmac::none(),
            buffer.clone(),
            messages,
        ));
        let mux = Arc::new(Mux::new());
        replicator.register(&mux);
        Server { db, buffer, mux }
    }

    #[tokio::test]
    async fn test_history_from_sequence_with_keys() {
        let root = CancellationToken::new();
        let server_identity = Identity::generate();
        let server = server(&server_identity);
        publish_posts(&server.db, &server_identity, 4);

        let (peer, _) = peer_pair(
            (Identity::generate(), Arc::new(Mux::new())),
            (server_identity.clone(), server.mux.clone()),
            &root,
        )
        .await;

        let request = Request::new(
            &["createHistoryStream"],
            ProcedureType::Source,
            json!([{"id": server_identity.feed(), "seq": 2, "limit": 2}]),
        );
        let mut stream = peer.conn().perform_request(request).await.unwrap();
        let mut sequences = Vec::new();
        while let Some(value) = stream.next_value().await {
            let value = value.unwrap();
            assert!(value["key"].as_str().unwrap().starts_with('%'));
            sequences.push(value["value"]["sequence"].as_u64().unwrap());
        }
        assert_eq!(sequences, vec![2, 3]);
        root.cancel();
    }

    #[tokio::test]
    async fn test_live_history_follows_new_messages() {
        let root = CancellationToken::new();
        let server_identity = Identity::generate();
        let server = server(&server_identity);
        publish_posts(&server.db, &server_identity, 1);

        let (peer, _) = peer_pair(
            (Identity::generate(), Arc::new(Mux::new())),
            (server_identity.clone(), server.mux.clone()),
            &root,
        )
        .await;

        let request = Request::new(
            &["createHistoryStream"],
            ProcedureType::Source,
            json!([{"id": server_identity.feed(), "live": true, "keys": false}]),
        );
        let mut stream = peer.conn().perform_request(request).await.unwrap();
        let first = stream.next_value().await.unwrap().unwrap();
        assert_eq!(first["sequence"], 1);

        // A message arriving through the buffer is pushed to the live stream.
        let mut feed = scuttle_shared::Feed::new(
            server_identity.feed(),
            server.db.view(|tx| tx.feeds.tip(&server_identity.feed())).unwrap(),
        );
        feed.create_message(
            &server_identity,
            &MessageHmac::none(),
            chrono::Utc::now(),
            &json!({"type": "post", "text": "live"}),
        )
        .unwrap();
        server.buffer.handle(feed.into_appended().remove(0));
        assert_eq!(server.buffer.persist().unwrap(), 1);

        let second = stream.next_value().await.unwrap().unwrap();
        assert_eq!(second["sequence"], 2);
        assert_eq!(second["content"]["text"], "live");
        root.cancel();
    }
}
