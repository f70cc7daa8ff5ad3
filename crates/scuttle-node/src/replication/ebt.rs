//! Epidemic broadcast tree replication (`ebt.replicate`).
//!
//! Both sides exchange notes, maps from feed to an encoded sequence, and
//! then push messages the other side asked to receive. A note is answered
//! once per feed; later notes only update what the remote wants.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use scuttle_net::{
    Body, ClosingHandler, Connection, Handler, IncomingRequest, Peer, ProcedureType, Request,
    RequestStream, ResponseStream, ResponseWriter, RpcError,
};
use scuttle_shared::{FeedRef, Message, PublicIdentity};

use super::{message_body, FeedReplicator, PAGE_SIZE};
use crate::error::{NodeError, Result};

pub const EBT_VERSION: u64 = 3;
pub const EBT_FORMAT: &str = "classic";

/// One feed's entry in a note: how far the sender is and whether it wants
/// to receive newer messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    pub sequence: u64,
    pub receive: bool,
}

impl Note {
    /// Encoded value of a feed the sender does not replicate.
    pub const NOT_REPLICATING: i64 = -1;

    pub fn encode(self) -> i64 {
        let sequence = i64::try_from(self.sequence).unwrap_or(i64::MAX >> 1);
        (sequence << 1) | i64::from(!self.receive)
    }

    /// `None` for negative values, which mean "not replicating".
    pub fn decode(value: i64) -> Option<Self> {
        if value < 0 {
            return None;
        }
        Some(Self {
            sequence: (value >> 1) as u64,
            receive: value & 1 == 0,
        })
    }
}

/// Either end of an `ebt.replicate` duplex.
enum EbtStream {
    Client(ResponseStream),
    Server {
        caller: RequestStream,
        writer: ResponseWriter,
    },
}

impl EbtStream {
    async fn recv(&mut self) -> Option<std::result::Result<Body, RpcError>> {
        match self {
            EbtStream::Client(stream) => stream.next().await,
            EbtStream::Server { caller, .. } => caller.next().await,
        }
    }

    async fn send(&mut self, body: Body) -> std::result::Result<(), RpcError> {
        match self {
            EbtStream::Client(stream) => stream.send(body).await,
            EbtStream::Server { writer, .. } => writer.send(body).await,
        }
    }

    async fn finish(&mut self) {
        let _ = match self {
            EbtStream::Client(stream) => stream.close().await,
            EbtStream::Server { writer, .. } => writer.end().await,
        };
    }
}

/// Per-connection replication state.
struct Session<'a> {
    replicator: &'a FeedReplicator,
    remote: PublicIdentity,
    /// Feeds we asked the remote to send.
    requested: HashSet<FeedRef>,
    /// Feeds we already sent our note for.
    answered: HashSet<FeedRef>,
    /// Feeds the remote asked to receive, with the sequence it holds.
    remote_wants: HashMap<FeedRef, u64>,
}

impl<'a> Session<'a> {
    fn new(replicator: &'a FeedReplicator, remote: PublicIdentity) -> Self {
        Self {
            replicator,
            remote,
            requested: HashSet::new(),
            answered: HashSet::new(),
            remote_wants: HashMap::new(),
        }
    }

    fn initial_notes(&mut self) -> Result<Map<String, Value>> {
        let mut notes = Map::new();
        for feed in self.replicator.wanted_feeds()? {
            let sequence = self.replicator.local_sequence(&feed)?;
            let note = Note {
                sequence,
                receive: true,
            };
            notes.insert(feed.to_string(), json!(note.encode()));
            self.requested.insert(feed);
            self.answered.insert(feed);
        }
        Ok(notes)
    }

    async fn on_body(&mut self, stream: &mut EbtStream, body: Body) -> Result<()> {
        let Value::Object(map) = body.to_value()? else {
            return Err(RpcError::Protocol("EBT packet is not an object".to_string()).into());
        };

        if map.contains_key("signature") {
            let message = self.replicator.verify(body.into_bytes())?;
            return self.on_message(message);
        }

        let mut replies = Map::new();
        for (key, value) in map {
            let (Ok(feed), Some(value)) = (key.parse::<FeedRef>(), value.as_i64()) else {
                trace!(peer = %self.remote, key, "skipping malformed note");
                continue;
            };
            if self.answered.insert(feed) {
                replies.insert(feed.to_string(), json!(self.unrequested_note(&feed)?));
            }
            self.on_note(stream, feed, value).await?;
        }
        if !replies.is_empty() {
            stream.send(Body::json(&replies)?).await?;
        }
        Ok(())
    }

    /// Our note for a feed the remote brought up and we did not request.
    fn unrequested_note(&self, feed: &FeedRef) -> Result<i64> {
        let stored = self.replicator.local_stored_sequence(feed)?;
        Ok(if stored > 0 {
            Note {
                sequence: stored,
                receive: false,
            }
            .encode()
        } else {
            Note::NOT_REPLICATING
        })
    }

    async fn on_note(&mut self, stream: &mut EbtStream, feed: FeedRef, value: i64) -> Result<()> {
        match Note::decode(value) {
            Some(note) if note.receive => {
                self.remote_wants.insert(feed, note.sequence);
                self.send_from(stream, &feed, note.sequence + 1, u64::MAX).await
            }
            _ => {
                self.remote_wants.remove(&feed);
                Ok(())
            }
        }
    }

    fn on_message(&mut self, message: Message) -> Result<()> {
        if !self.requested.contains(&message.feed) {
            trace!(peer = %self.remote, feed = %message.feed, "dropping unrequested message");
            return Ok(());
        }
        // The remote holds it, so it must not be echoed back.
        if let Some(have) = self.remote_wants.get_mut(&message.feed) {
            *have = (*have).max(message.sequence);
        }
        self.replicator.buffer.handle(message);
        Ok(())
    }

    /// A message of ours was persisted; forward it if the remote wants it.
    async fn on_local_message(&mut self, stream: &mut EbtStream, message: &Message) -> Result<()> {
        match self.remote_wants.get(&message.feed) {
            Some(&have) if message.sequence > have => {
                self.send_from(stream, &message.feed, have + 1, message.sequence)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Send stored messages of `feed` from `from` up to `until` inclusive.
    async fn send_from(
        &mut self,
        stream: &mut EbtStream,
        feed: &FeedRef,
        mut from: u64,
        until: u64,
    ) -> Result<()> {
        while from <= until {
            let messages = self.replicator.stored_messages(feed, from, PAGE_SIZE)?;
            if messages.is_empty() {
                break;
            }
            for message in messages.iter().take_while(|m| m.sequence <= until) {
                stream.send(message_body(message)).await?;
                from = message.sequence + 1;
                self.remote_wants.insert(*feed, message.sequence);
            }
            if messages.len() < PAGE_SIZE {
                break;
            }
        }
        Ok(())
    }
}

impl FeedReplicator {
    /// Open an EBT session on a connection we dialed. Returns when the
    /// session ends; an error means the remote refused or broke it.
    pub async fn run_ebt_client(&self, peer: &Peer, cancel: &CancellationToken) -> Result<()> {
        let request = Request::new(
            &["ebt", "replicate"],
            ProcedureType::Duplex,
            json!([{"version": EBT_VERSION, "format": EBT_FORMAT}]),
        );
        let stream = peer.conn().perform_request(request).await?;
        debug!(peer = %peer.identity(), "EBT session opened");
        self.run_ebt_session(*peer.identity(), EbtStream::Client(stream), cancel)
            .await
    }

    async fn run_ebt_session(
        &self,
        remote: PublicIdentity,
        mut stream: EbtStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut session = Session::new(self, remote);
        let mut live = self.messages.subscribe();

        let result: Result<()> = async {
            let notes = session.initial_notes()?;
            trace!(peer = %remote, feeds = notes.len(), "sending notes");
            stream.send(Body::json(&notes)?).await?;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.recv() => match item {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(NodeError::from(e)),
                        Some(Ok(body)) => session.on_body(&mut stream, body).await?,
                    },
                    Some(message) = live.recv() => {
                        session.on_local_message(&mut stream, &message).await?;
                    }
                }
            }
        }
        .await;

        stream.finish().await;
        result
    }
}

/// Serves `ebt.replicate` and keeps track of which connections have a
/// session, so the supervisor does not start a second replication.
pub struct EbtReplicateHandler {
    replicator: Arc<FeedReplicator>,
}

impl EbtReplicateHandler {
    pub fn new(replicator: Arc<FeedReplicator>) -> Self {
        Self { replicator }
    }
}

#[async_trait]
impl Handler for EbtReplicateHandler {
    async fn handle(&self, conn: &Connection, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            stream,
            mut writer,
        } = incoming;

        let args = request.first_arg();
        let version = args.get("version").and_then(Value::as_u64);
        let format = args
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or(EBT_FORMAT);
        if request.typ != ProcedureType::Duplex
            || version != Some(EBT_VERSION)
            || format != EBT_FORMAT
        {
            debug!(peer = %conn.remote(), ?version, format, "rejecting EBT session");
            let _ = writer
                .end_with_error("unsupported ebt version or format")
                .await;
            return;
        }

        self.replicator.ebt_sessions().insert(conn.id());
        let cancel = conn.context();
        let result = self
            .replicator
            .run_ebt_session(
                *conn.remote(),
                EbtStream::Server {
                    caller: stream,
                    writer,
                },
                &cancel,
            )
            .await;

        match result {
            Ok(()) => debug!(peer = %conn.remote(), "EBT session ended"),
            Err(e) if cancel.is_cancelled() || e.is_connection_closed() => {}
            Err(e) => {
                debug!(
                    peer = %conn.remote(),
                    error = %e,
                    "EBT session failed, falling back to createHistoryStream"
                );
                self.replicator
                    .replicate_classic(&Peer::new(conn.clone()), &cancel)
                    .await;
            }
        }
        self.replicator.ebt_sessions().remove(&conn.id());
    }
}

#[async_trait]
impl ClosingHandler for EbtReplicateHandler {
    async fn on_close(&self, conn: &Connection) {
        if self.replicator.ebt_sessions().remove(&conn.id()) {
            trace!(peer = %conn.remote(), "EBT connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::buffer::{BufferConfig, MessageBuffer};
    use crate::replication::testing::{peer_pair, publish_posts};
    use scuttle_net::{Mux, PubSub};
    use scuttle_shared::{Identity, MessageHmac};
    use scuttle_store::Database;

    struct Side {
        identity: Identity,
        db: Arc<Database>,
        replicator: Arc<FeedReplicator>,
        mux: Arc<Mux>,
    }

    fn side(register: bool) -> Side {
        let identity = Identity::generate();
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
            buffer,
            messages,
        ));
        let mux = Arc::new(Mux::new());
        if register {
            replicator.register(&mux);
        }
        Side {
            identity,
            db,
            replicator,
            mux,
        }
    }

    fn want(side: &Side, feed: &FeedRef) {
        side.db
            .transact(|tx| {
                tx.feed_want_list
                    .add(feed, Utc::now() + chrono::Duration::hours(1))
            })
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_note_encoding() {
        let note = Note {
            sequence: 7,
            receive: true,
        };
        assert_eq!(note.encode(), 14);
        assert_eq!(Note::decode(14), Some(note));

        let note = Note {
            sequence: 7,
            receive: false,
        };
        assert_eq!(note.encode(), 15);
        assert_eq!(Note::decode(15), Some(note));

        assert_eq!(Note::decode(Note::NOT_REPLICATING), None);
        assert_eq!(
            Note::decode(0),
            Some(Note {
                sequence: 0,
                receive: true
            })
        );
    }

    #[tokio::test]
    async fn test_ebt_replicates_both_ways() {
        let root = CancellationToken::new();
        let client = side(false);
        let server = side(true);
        publish_posts(&server.db, &server.identity, 3);
        publish_posts(&client.db, &client.identity, 2);
        want(&client, &server.identity.feed());
        want(&server, &client.identity.feed());

        let (peer, _) = peer_pair(
            (client.identity.clone(), client.mux.clone()),
            (server.identity.clone(), server.mux.clone()),
            &root,
        )
        .await;

        let replicator = client.replicator.clone();
        let session_peer = peer.clone();
        let task = tokio::spawn(async move { replicator.replicate(&session_peer).await });

        let client_buffer = client.replicator.buffer.clone();
        eventually(|| client_buffer.len() == 3).await;
        let server_buffer = server.replicator.buffer.clone();
        eventually(|| server_buffer.len() == 2).await;
        assert_eq!(server.replicator.ebt_sessions().len(), 1);

        assert_eq!(client.replicator.buffer.persist().unwrap(), 3);
        assert_eq!(server.replicator.buffer.persist().unwrap(), 2);
        let tip = client
            .db
            .view(|tx| tx.feeds.tip(&server.identity.feed()))
            .unwrap()
            .unwrap();
        assert_eq!(tip.sequence, 3);

        root.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_history_streams() {
        let root = CancellationToken::new();
        let client = side(false);
        let server = side(false);
        // Only createHistoryStream is served.
        server.mux.add_handler(
            scuttle_net::ProcedureName::new(&["createHistoryStream"]),
            Arc::new(super::super::CreateHistoryStreamHandler::new(
                server.replicator.clone(),
            )),
        );
        publish_posts(&server.db, &server.identity, 2);
        want(&client, &server.identity.feed());

        let (peer, _) = peer_pair(
            (client.identity.clone(), client.mux.clone()),
            (server.identity.clone(), server.mux.clone()),
            &root,
        )
        .await;

        let err = client
            .replicator
            .run_ebt_client(&peer, &root)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Rpc(ref e) if e.remote_message_contains("method not found")));

        let replicator = client.replicator.clone();
        let task = tokio::spawn(async move { replicator.replicate(&peer).await });
        let client_buffer = client.replicator.buffer.clone();
        eventually(|| client_buffer.len() == 2).await;

        root.cancel();
        task.await.unwrap();
    }
}
