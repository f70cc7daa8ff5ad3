//! One RPC session over an established box stream.
//!
//! A read task routes packets by request number and a write task owns the
//! box stream writer, so packets of concurrent streams never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use scuttle_shared::constants::RPC_REQUEST_TIMEOUT_SECS;
use scuttle_shared::PublicIdentity;

use crate::boxstream::{box_stream, BoxStreamReader, BoxStreamWriter};
use crate::error::{RemoteError, RpcError};
use crate::handshake::HandshakeResult;

use super::frame::{read_frame, write_frame, write_goodbye, Body, Frame};
use super::request::Request;
use super::stream::{RequestStream, ResponseStream, ResponseWriter};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(RPC_REQUEST_TIMEOUT_SECS);
const OUTGOING_QUEUE: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type StreamItem = Result<Body, RpcError>;

/// A procedure call received from the remote side.
pub struct IncomingRequest {
    pub request: Request,
    /// Packets the caller sends after the request (sink and duplex calls).
    pub stream: RequestStream,
    pub writer: ResponseWriter,
}

/// Receives every new inbound procedure call of a connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, conn: Connection, incoming: IncomingRequest);
}

#[derive(Default)]
struct Streams {
    /// Responses to requests we made, keyed by our request number.
    outbound: HashMap<i32, mpsc::UnboundedSender<StreamItem>>,
    /// Caller packets of inbound streams, keyed by the caller's number.
    inbound: HashMap<i32, mpsc::UnboundedSender<StreamItem>>,
    /// Inbound streams we already ended while the caller has not.
    half_closed: HashSet<i32>,
    closed: bool,
}

struct Inner {
    id: u64,
    remote: PublicIdentity,
    initiated_by_remote: bool,
    next_request: AtomicI32,
    outgoing: mpsc::Sender<Frame>,
    streams: Mutex<Streams>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("initiated_by_remote", &self.inner.initiated_by_remote)
            .finish()
    }
}

impl Connection {
    /// Wrap `io` in a box stream keyed by `handshake` and start the read and
    /// write tasks. The connection is closed when `parent` is cancelled.
    pub fn start<S>(
        io: S,
        handshake: HandshakeResult,
        initiated_by_remote: bool,
        handler: Arc<dyn RequestHandler>,
        parent: &CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = box_stream(io, handshake.read, handshake.write);
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);

        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote: handshake.remote,
                initiated_by_remote,
                next_request: AtomicI32::new(1),
                outgoing,
                streams: Mutex::new(Streams::default()),
                cancel: parent.child_token(),
            }),
        };

        tokio::spawn(write_loop(writer, outgoing_rx, conn.inner.cancel.clone()));
        tokio::spawn(conn.clone().read_loop(reader, handler));
        debug!(peer = %conn.remote(), id = conn.id(), "RPC connection started");
        conn
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote(&self) -> &PublicIdentity {
        &self.inner.remote
    }

    pub fn was_initiated_by_remote(&self) -> bool {
        self.inner.initiated_by_remote
    }

    /// Cancellation scope of this connection; cancelled when it closes.
    pub fn context(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Close the connection and fail every open stream.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(peer = %self.remote(), id = self.id(), "closing RPC connection");
        }
        self.inner.cancel.cancel();
        self.fail_all();
    }

    /// Send `request` and return the stream of its responses.
    pub async fn perform_request(&self, request: Request) -> Result<ResponseStream, RpcError> {
        let number = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.streams();
            if streams.closed {
                return Err(RpcError::ConnectionClosed);
            }
            streams.outbound.insert(number, tx);
        }

        debug!(peer = %self.remote(), request = number, name = %request.name, "performing request");
        let frame = Frame {
            stream: request.typ.is_stream(),
            end_or_error: false,
            request_number: number,
            body: Body::json(&request.to_value())?,
        };
        if let Err(e) = self.send_frame(frame).await {
            self.streams().outbound.remove(&number);
            return Err(e);
        }
        Ok(ResponseStream::new(self.clone(), number, request.typ, rx))
    }

    /// Perform an async request and wait for its single response.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Body, RpcError> {
        let mut stream = self.perform_request(request).await?;
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(RpcError::Protocol("stream ended without a response".to_string())),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// [`Connection::call`] with the default timeout, decoding a JSON body.
    pub async fn call_json(&self, request: Request) -> Result<Value, RpcError> {
        self.call(request, REQUEST_TIMEOUT).await?.to_value()
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner
            .outgoing
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue `frame` without waiting; used from destructors.
    pub(crate) fn try_send_frame(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.inner.outgoing.try_send(frame) {
            debug!(peer = %self.remote(), error = %e, "dropping packet");
        }
    }

    pub(crate) fn forget_outbound(&self, number: i32) {
        self.streams().outbound.remove(&number);
    }

    /// Our half of inbound stream `number` is done. Packets the caller
    /// still sends are dropped until its own end arrives.
    pub(crate) fn end_inbound(&self, number: i32) {
        let mut streams = self.streams();
        if streams.inbound.remove(&number).is_some() {
            streams.half_closed.insert(number);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_streams(&self) -> usize {
        let streams = self.streams();
        streams.outbound.len() + streams.inbound.len() + streams.half_closed.len()
    }

    fn streams(&self) -> MutexGuard<'_, Streams> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail_all(&self) {
        let mut guard = self.streams();
        let streams = &mut *guard;
        if streams.closed {
            return;
        }
        streams.closed = true;
        streams.half_closed.clear();
        for (_, tx) in streams.outbound.drain().chain(streams.inbound.drain()) {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    async fn read_loop<R>(self, mut reader: BoxStreamReader<R>, handler: Arc<dyn RequestHandler>)
    where
        R: AsyncRead + Unpin,
    {
        let cancel = self.inner.cancel.clone();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(frame)) => self.route(frame, &handler),
                Ok(None) => {
                    debug!(peer = %self.remote(), "remote ended the RPC session");
                    break;
                }
                Err(e) => {
                    debug!(peer = %self.remote(), error = %e, "RPC read failed");
                    break;
                }
            }
        }
        self.close();
    }

    fn route(&self, frame: Frame, handler: &Arc<dyn RequestHandler>) {
        match frame.request_number {
            n if n < 0 => self.route_response(n.saturating_neg(), frame),
            n if n > 0 => self.route_request(n, frame, handler),
            _ => debug!(peer = %self.remote(), "packet without request number"),
        }
    }

    fn route_response(&self, number: i32, frame: Frame) {
        let mut streams = self.streams();
        let Some(tx) = streams.outbound.get(&number) else {
            debug!(peer = %self.remote(), request = number, "response for unknown request");
            return;
        };

        if frame.end_or_error {
            if let Some(error) = end_error(&frame.body) {
                let _ = tx.send(Err(error));
            }
            streams.outbound.remove(&number);
            return;
        }

        let _ = tx.send(Ok(frame.body));
        if !frame.stream {
            streams.outbound.remove(&number);
        }
    }

    fn route_request(&self, number: i32, frame: Frame, handler: &Arc<dyn RequestHandler>) {
        let mut streams = self.streams();
        if let Some(tx) = streams.inbound.get(&number) {
            if frame.end_or_error {
                if let Some(error) = end_error(&frame.body) {
                    let _ = tx.send(Err(error));
                }
                streams.inbound.remove(&number);
            } else {
                let _ = tx.send(Ok(frame.body));
            }
            return;
        }
        if streams.half_closed.contains(&number) {
            if frame.end_or_error {
                streams.half_closed.remove(&number);
            } else {
                debug!(peer = %self.remote(), request = number, "dropping packet for ended stream");
            }
            return;
        }
        if frame.end_or_error {
            // Late end of a stream that is already finished here.
            return;
        }

        let request = match frame.body.to_value().and_then(|v| Request::from_value(&v)) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %self.remote(), request = number, error = %e, "malformed request");
                drop(streams);
                let mut writer = ResponseWriter::new(self.clone(), number, frame.stream);
                tokio::spawn(async move {
                    let _ = writer.end_with_error("malformed request").await;
                });
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if request.typ.is_stream() {
            streams.inbound.insert(number, tx);
        }
        drop(streams);

        debug!(peer = %self.remote(), request = number, name = %request.name, "incoming request");
        let incoming = IncomingRequest {
            writer: ResponseWriter::new(self.clone(), number, request.typ.is_stream()),
            stream: RequestStream::new(rx),
            request,
        };
        let conn = self.clone();
        let handler = handler.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = handler.handle(conn, incoming) => {}
            }
        });
    }
}

/// Error carried by an end-or-error packet, `None` for a clean end.
fn end_error(body: &Body) -> Option<RpcError> {
    match body.to_value() {
        Ok(Value::Object(map)) if map.contains_key("message") || map.contains_key("name") => {
            Some(RpcError::Remote(RemoteError::from_value(Value::Object(map))))
        }
        Ok(_) => None,
        Err(_) if body.bytes.is_empty() => None,
        Err(e) => Some(e),
    }
}

async fn write_loop<W>(
    mut writer: BoxStreamWriter<W>,
    mut outgoing: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(error = %e, "RPC write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                // Frames queued before the close still go out.
                while let Ok(frame) = outgoing.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = write_goodbye(&mut writer).await;
    let _ = writer.close().await;
    cancel.cancel();
}
