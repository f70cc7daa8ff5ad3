//! Per-request stream handles for both sides of a call.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

use super::connection::{Connection, StreamItem};
use super::frame::{Body, Frame};
use super::request::ProcedureType;

fn end_frame(request_number: i32, stream: bool, body: Body) -> Frame {
    Frame {
        stream,
        end_or_error: true,
        request_number,
        body,
    }
}

fn clean_end(request_number: i32, stream: bool) -> Frame {
    end_frame(request_number, stream, Body::json(&true).unwrap_or_else(|_| Body::text("true")))
}

fn error_body(message: &str) -> Body {
    let value = json!({"name": "Error", "message": message, "stack": ""});
    Body::json(&value).unwrap_or_else(|_| Body::text(message))
}

// ---------------------------------------------------------------------------
// Caller side
// ---------------------------------------------------------------------------

/// Responses to a request we performed, in the order the remote sent them.
///
/// `next` yields `None` after a clean end. Dropping an unfinished stream
/// tells the remote to stop.
pub struct ResponseStream {
    conn: Connection,
    request_number: i32,
    typ: ProcedureType,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    local_end_sent: bool,
    remote_ended: bool,
}

impl ResponseStream {
    pub(crate) fn new(
        conn: Connection,
        request_number: i32,
        typ: ProcedureType,
        rx: mpsc::UnboundedReceiver<StreamItem>,
    ) -> Self {
        Self {
            conn,
            request_number,
            typ,
            rx,
            local_end_sent: false,
            remote_ended: false,
        }
    }

    pub fn request_number(&self) -> i32 {
        self.request_number
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn next(&mut self) -> Option<Result<Body, RpcError>> {
        if self.remote_ended {
            return None;
        }
        let item = self.rx.recv().await;
        if !matches!(item, Some(Ok(_))) {
            self.remote_ended = true;
            if self.typ.is_stream() && !self.local_end_sent {
                self.local_end_sent = true;
                let frame = clean_end(self.request_number, true);
                let _ = self.conn.send_frame(frame).await;
            }
        }
        item
    }

    /// Next body decoded as JSON.
    pub async fn next_value(&mut self) -> Option<Result<Value, RpcError>> {
        Some(self.next().await?.and_then(|body| body.to_value()))
    }

    /// Stream a packet to the remote (sink and duplex calls).
    pub async fn send(&mut self, body: Body) -> Result<(), RpcError> {
        if !self.typ.caller_streams() {
            return Err(RpcError::Protocol(format!(
                "cannot stream into a {:?} call",
                self.typ
            )));
        }
        if self.local_end_sent {
            return Err(RpcError::ConnectionClosed);
        }
        self.conn
            .send_frame(Frame {
                stream: true,
                end_or_error: false,
                request_number: self.request_number,
                body,
            })
            .await
    }

    pub async fn send_json(&mut self, value: &impl Serialize) -> Result<(), RpcError> {
        self.send(Body::json(value)?).await
    }

    /// End our half of the stream.
    pub async fn close(&mut self) -> Result<(), RpcError> {
        if self.local_end_sent {
            return Ok(());
        }
        self.local_end_sent = true;
        self.conn
            .send_frame(clean_end(self.request_number, self.typ.is_stream()))
            .await
    }

    /// End our half of the stream with an error.
    pub async fn close_with_error(&mut self, message: &str) -> Result<(), RpcError> {
        if self.local_end_sent {
            return Ok(());
        }
        self.local_end_sent = true;
        self.conn
            .send_frame(end_frame(self.request_number, true, error_body(message)))
            .await
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.remote_ended {
            return;
        }
        self.conn.forget_outbound(self.request_number);
        if self.typ.is_stream() && !self.local_end_sent {
            self.conn.try_send_frame(clean_end(self.request_number, true));
        }
    }
}

// ---------------------------------------------------------------------------
// Callee side
// ---------------------------------------------------------------------------

/// Packets the caller streams after its request.
pub struct RequestStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl RequestStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StreamItem>) -> Self {
        Self { rx }
    }

    /// `None` once the caller ended its half cleanly.
    pub async fn next(&mut self) -> Option<Result<Body, RpcError>> {
        self.rx.recv().await
    }

    pub async fn next_value(&mut self) -> Option<Result<Value, RpcError>> {
        Some(self.next().await?.and_then(|body| body.to_value()))
    }
}

/// Writes responses to one inbound request.
pub struct ResponseWriter {
    conn: Connection,
    caller_number: i32,
    stream: bool,
    finished: bool,
}

impl ResponseWriter {
    pub(crate) fn new(conn: Connection, caller_number: i32, stream: bool) -> Self {
        Self {
            conn,
            caller_number,
            stream,
            finished: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn context(&self) -> CancellationToken {
        self.conn.context()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Send one response packet. For async calls this is the only response.
    pub async fn send(&mut self, body: Body) -> Result<(), RpcError> {
        if self.finished {
            return Err(RpcError::Protocol("response already finished".to_string()));
        }
        if !self.stream {
            self.finished = true;
        }
        self.conn
            .send_frame(Frame {
                stream: self.stream,
                end_or_error: false,
                request_number: -self.caller_number,
                body,
            })
            .await
    }

    pub async fn send_json(&mut self, value: &impl Serialize) -> Result<(), RpcError> {
        self.send(Body::json(value)?).await
    }

    /// Finish the response cleanly.
    pub async fn end(&mut self) -> Result<(), RpcError> {
        if self.finished {
            return Ok(());
        }
        self.finish();
        self.conn
            .send_frame(clean_end(-self.caller_number, self.stream))
            .await
    }

    /// Finish the response with `{name: "Error", message}`.
    pub async fn end_with_error(&mut self, message: &str) -> Result<(), RpcError> {
        if self.finished {
            return Ok(());
        }
        self.finish();
        self.conn
            .send_frame(end_frame(-self.caller_number, self.stream, error_body(message)))
            .await
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.stream {
            self.conn.end_inbound(self.caller_number);
        }
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finish();
        let frame = if self.stream {
            clean_end(-self.caller_number, true)
        } else {
            end_frame(-self.caller_number, false, error_body("no response"))
        };
        self.conn.try_send_frame(frame);
    }
}
