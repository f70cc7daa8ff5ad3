//! Blob replication.
//!
//! Every connection carries one `blobs.createWants` stream in each
//! direction. Entries map a blob to its size when the sender has it, or to
//! a negative distance when it wants it. Blobs we want and a peer has are
//! fetched with `blobs.get`, verified against their hash and stored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use scuttle_net::{
    Body, Connection, Handler, IncomingRequest, Mux, Peer, ProcedureName, ProcedureType, PubSub,
    Request, ResponseWriter,
};
use scuttle_shared::BlobRef;
use scuttle_store::{BlobStorage, Database, StoreError};

use crate::error::{NodeError, Result};

/// Size of the binary packets `blobs.get` answers with.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Wants farther away than this are not passed on.
const MAX_WANT_DISTANCE: i64 = 3;

/// Entries queued for one connection. They wait here until the remote
/// opens our wants stream.
struct WantsQueue {
    tx: mpsc::UnboundedSender<Value>,
    rx: Option<mpsc::UnboundedReceiver<Value>>,
}

impl WantsQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

pub struct BlobReplicator {
    db: Arc<Database>,
    storage: Arc<BlobStorage>,
    /// Entries for the `createWants` stream we serve on each connection.
    outgoing: Mutex<HashMap<u64, WantsQueue>>,
    downloading: Mutex<HashSet<BlobRef>>,
    downloaded: PubSub<BlobRef>,
}

impl BlobReplicator {
    pub fn new(db: Arc<Database>, storage: Arc<BlobStorage>) -> Self {
        Self {
            db,
            storage,
            outgoing: Mutex::new(HashMap::new()),
            downloading: Mutex::new(HashSet::new()),
            downloaded: PubSub::new("blob_downloaded"),
        }
    }

    pub fn register(self: &Arc<Self>, mux: &Mux) {
        mux.add_handler(
            ProcedureName::new(&["blobs", "get"]),
            Arc::new(GetBlobHandler {
                replicator: self.clone(),
            }),
        );
        mux.add_handler(
            ProcedureName::new(&["blobs", "has"]),
            Arc::new(HasBlobHandler {
                replicator: self.clone(),
            }),
        );
        mux.add_handler(
            ProcedureName::new(&["blobs", "createWants"]),
            Arc::new(CreateWantsHandler {
                replicator: self.clone(),
            }),
        );
    }

    pub fn storage(&self) -> &Arc<BlobStorage> {
        &self.storage
    }

    /// Published once per blob fetched from a peer.
    pub fn downloaded(&self) -> &PubSub<BlobRef> {
        &self.downloaded
    }

    fn outgoing(&self) -> MutexGuard<'_, HashMap<u64, WantsQueue>> {
        self.outgoing.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn downloading(&self) -> MutexGuard<'_, HashSet<BlobRef>> {
        self.downloading.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add `blob` to the want list until `until` and ask every connected
    /// peer for it. Does nothing if the blob is already stored.
    pub async fn want(&self, blob: &BlobRef, until: DateTime<Utc>) -> Result<()> {
        if self.storage.has(blob).await {
            return Ok(());
        }
        self.db.transact(|tx| tx.blob_want_list.add(blob, until))?;
        debug!(blob = %blob, %until, "wanting blob");
        self.broadcast(blob, -1, None);
        Ok(())
    }

    /// Store `data` as a new local blob.
    pub async fn create(&self, data: &[u8]) -> Result<BlobRef> {
        let blob = self.storage.store(data).await.map_err(blob_error)?;
        self.db.transact(|tx| tx.blob_want_list.delete(&blob))?;
        self.broadcast(&blob, data.len() as i64, None);
        Ok(blob)
    }

    /// Send `{blob: value}` on every connection's wants stream except
    /// `except`.
    fn broadcast(&self, blob: &BlobRef, value: i64, except: Option<u64>) {
        let entry = want_entry(blob, value);
        self.outgoing().retain(|conn_id, queue| {
            Some(*conn_id) == except || queue.tx.send(entry.clone()).is_ok()
        });
    }

    fn send_to(&self, conn_id: u64, blob: &BlobRef, value: i64) {
        let mut outgoing = self.outgoing();
        let queue = outgoing.entry(conn_id).or_insert_with(WantsQueue::new);
        let _ = queue.tx.send(want_entry(blob, value));
    }

    /// Hand the queue of `conn_id` to the stream serving it. A second
    /// stream on the same connection starts from an empty queue.
    fn take_queue(
        &self,
        conn_id: u64,
    ) -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
        let mut outgoing = self.outgoing();
        let queue = outgoing.entry(conn_id).or_insert_with(WantsQueue::new);
        if let Some(rx) = queue.rx.take() {
            return (queue.tx.clone(), rx);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *queue = WantsQueue {
            tx: tx.clone(),
            rx: None,
        };
        (tx, rx)
    }

    fn local_wants(&self) -> Result<Vec<BlobRef>> {
        Ok(self
            .db
            .view(|tx| tx.blob_want_list.list())?
            .into_iter()
            .map(|entry| entry.reference)
            .collect())
    }

    fn is_wanted(&self, blob: &BlobRef) -> Result<bool> {
        Ok(self.db.view(|tx| tx.blob_want_list.contains(blob))?)
    }

    /// Consume the remote's wants stream until the connection closes.
    pub async fn replicate(self: &Arc<Self>, peer: &Peer) {
        let cancel = peer.conn().context();
        let request = Request::new(&["blobs", "createWants"], ProcedureType::Source, json!([]));
        let mut stream = match peer.conn().perform_request(request).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer.identity(), error = %e, "opening createWants failed");
                return;
            }
        };

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next_value() => item,
            };
            match item {
                None => break,
                Some(Ok(Value::Object(entries))) => {
                    if let Err(e) = self.on_wants(peer, entries).await {
                        debug!(peer = %peer.identity(), error = %e, "handling blob wants failed");
                    }
                }
                Some(Ok(other)) => {
                    debug!(peer = %peer.identity(), value = %other, "unexpected wants entry");
                }
                Some(Err(e)) => {
                    debug!(peer = %peer.identity(), error = %e, "createWants stream failed");
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            self.outgoing().remove(&peer.conn().id());
        }
    }

    async fn on_wants(self: &Arc<Self>, peer: &Peer, entries: Map<String, Value>) -> Result<()> {
        for (key, value) in entries {
            let (Ok(blob), Some(value)) = (key.parse::<BlobRef>(), value.as_i64()) else {
                trace!(peer = %peer.identity(), key, "skipping malformed wants entry");
                continue;
            };

            if value >= 0 {
                let size = value as u64;
                if self.is_wanted(&blob)? && !self.storage.has(&blob).await {
                    self.spawn_download(peer, blob, size);
                }
                continue;
            }

            if let Some(size) = self.storage.size(&blob).await {
                self.send_to(peer.conn().id(), &blob, size as i64);
            } else if self.is_wanted(&blob)? && -value < MAX_WANT_DISTANCE {
                self.broadcast(&blob, value - 1, Some(peer.conn().id()));
            }
        }
        Ok(())
    }

    fn spawn_download(self: &Arc<Self>, peer: &Peer, blob: BlobRef, size: u64) {
        if size > self.storage.max_size() {
            debug!(peer = %peer.identity(), blob = %blob, size, "not fetching oversized blob");
            return;
        }
        if !self.downloading().insert(blob) {
            return;
        }

        let this = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            match this.download(&peer, &blob).await {
                Ok(size) => info!(peer = %peer.identity(), blob = %blob, size, "downloaded blob"),
                Err(e) => debug!(peer = %peer.identity(), blob = %blob, error = %e, "blob download failed"),
            }
            this.downloading().remove(&blob);
        });
    }

    /// Fetch `blob` from `peer`, verify and store it. Returns its size.
    pub async fn download(&self, peer: &Peer, blob: &BlobRef) -> Result<usize> {
        let max = self.storage.max_size();
        let request = Request::new(
            &["blobs", "get"],
            ProcedureType::Source,
            json!([{"key": blob, "max": max}]),
        );
        let mut stream = peer.conn().perform_request(request).await?;

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?.bytes);
            if data.len() as u64 > max {
                return Err(NodeError::BlobTooLarge {
                    size: data.len() as u64,
                    max,
                });
            }
        }

        self.storage
            .store_verified(blob, &data)
            .await
            .map_err(blob_error)?;
        self.db.transact(|tx| tx.blob_want_list.delete(blob))?;
        self.downloaded.publish(*blob);
        self.broadcast(blob, data.len() as i64, None);
        Ok(data.len())
    }
}

fn want_entry(blob: &BlobRef, value: i64) -> Value {
    let mut entry = Map::new();
    entry.insert(blob.to_string(), json!(value));
    Value::Object(entry)
}

fn blob_error(e: StoreError) -> NodeError {
    match e {
        StoreError::BlobTooLarge { size, max } => NodeError::BlobTooLarge { size, max },
        other => NodeError::Store(other),
    }
}

/// Arguments of `blobs.get`: a bare ref or `{key, max}`.
fn parse_get_args(arg: &Value) -> Result<(BlobRef, Option<u64>)> {
    let (key, max) = match arg {
        Value::String(key) => (key.as_str(), None),
        Value::Object(map) => (
            map.get("key")
                .or_else(|| map.get("id"))
                .and_then(Value::as_str)
                .ok_or_else(|| NodeError::InvalidArgument("missing blob key".to_string()))?,
            map.get("max").and_then(Value::as_u64),
        ),
        _ => return Err(NodeError::InvalidArgument("expected a blob ref".to_string())),
    };
    let blob = key
        .parse()
        .map_err(|e| NodeError::InvalidArgument(format!("invalid blob ref: {e}")))?;
    Ok((blob, max))
}

struct GetBlobHandler {
    replicator: Arc<BlobReplicator>,
}

impl GetBlobHandler {
    async fn serve(&self, arg: &Value, writer: &mut ResponseWriter) -> Result<()> {
        let (blob, max) = parse_get_args(arg)?;
        let storage = &self.replicator.storage;
        let size = storage
            .size(&blob)
            .await
            .ok_or(NodeError::BlobNotFound(blob))?;
        if let Some(max) = max {
            if size > max {
                return Err(NodeError::BlobTooLarge { size, max });
            }
        }

        let data = storage.get(&blob).await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            writer.send(Body::binary(chunk.to_vec())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for GetBlobHandler {
    async fn handle(&self, conn: &Connection, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            mut writer,
            ..
        } = incoming;
        match self.serve(request.first_arg(), &mut writer).await {
            Ok(()) => {
                let _ = writer.end().await;
            }
            Err(e) if e.is_connection_closed() => {}
            Err(e) => {
                debug!(peer = %conn.remote(), error = %e, "blobs.get failed");
                let _ = writer.end_with_error(&e.to_string()).await;
            }
        }
    }
}

struct HasBlobHandler {
    replicator: Arc<BlobReplicator>,
}

#[async_trait]
impl Handler for HasBlobHandler {
    async fn handle(&self, _conn: &Connection, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            mut writer,
            ..
        } = incoming;
        let result = match request.first_arg().as_str().map(str::parse::<BlobRef>) {
            Some(Ok(blob)) => writer.send_json(&self.replicator.storage.has(&blob).await).await,
            _ => writer.end_with_error("expected a blob ref").await,
        };
        if let Err(e) = result {
            trace!(error = %e, "blobs.has response not sent");
        }
    }
}

/// Serves our side of the want/have exchange.
struct CreateWantsHandler {
    replicator: Arc<BlobReplicator>,
}

#[async_trait]
impl Handler for CreateWantsHandler {
    async fn handle(&self, conn: &Connection, incoming: IncomingRequest) {
        let IncomingRequest {
            mut stream,
            mut writer,
            ..
        } = incoming;
        let cancel = writer.context();

        let (tx, mut rx) = self.replicator.take_queue(conn.id());
        match self.replicator.local_wants() {
            Ok(wants) => {
                for blob in wants {
                    let _ = tx.send(want_entry(&blob, -1));
                }
            }
            Err(e) => warn!(error = %e, "listing wanted blobs failed"),
        }
        drop(tx);
        trace!(peer = %conn.remote(), "serving blob wants");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                // The caller closed its end.
                None = stream.next() => break,
                entry = rx.recv() => match entry {
                    Some(entry) => {
                        if writer.send_json(&entry).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.replicator.outgoing().remove(&conn.id());
        let _ = writer.end().await;
    }
}
