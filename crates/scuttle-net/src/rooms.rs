//! Room servers: attendant tracking and tunneled connections.
//!
//! A room relays `tunnel.connect` duplex streams between its attendants.
//! The bytes carried by such a stream are a complete, independently
//! handshaked session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use scuttle_shared::PublicIdentity;

use crate::error::RpcError;
use crate::mux::Handler;
use crate::peer::Peer;
use crate::pubsub::PubSub;
use crate::rpc::{
    Body, Connection, IncomingRequest, ProcedureType, Request, RequestStream, ResponseStream,
    ResponseWriter,
};
use crate::transport::Transport;

const TUNNEL_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub membership: bool,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Ask `conn` for room metadata; `None` when the peer is not a room.
pub async fn room_metadata(conn: &Connection) -> Option<RoomMetadata> {
    let request = Request::new(&["room", "metadata"], ProcedureType::Async, json!([]));
    match conn.call_json(request).await {
        Ok(value) => serde_json::from_value(value).ok().or(Some(RoomMetadata::default())),
        Err(e) => {
            debug!(peer = %conn.remote(), error = %e, "not a room");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttendantEvent {
    State(Vec<PublicIdentity>),
    Joined(PublicIdentity),
    Left(PublicIdentity),
}

impl AttendantEvent {
    pub fn parse(value: &Value) -> Result<Self, RpcError> {
        let invalid = || RpcError::Protocol(format!("invalid attendant event: {value}"));
        let id = |v: &Value| -> Result<PublicIdentity, RpcError> {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(invalid)
        };
        match value.get("type").and_then(Value::as_str) {
            Some("state") => {
                let ids = value
                    .get("ids")
                    .and_then(Value::as_array)
                    .ok_or_else(invalid)?;
                Ok(AttendantEvent::State(
                    ids.iter().map(id).collect::<Result<_, _>>()?,
                ))
            }
            Some("joined") => Ok(AttendantEvent::Joined(id(value.get("id").ok_or_else(invalid)?)?)),
            Some("left") => Ok(AttendantEvent::Left(id(value.get("id").ok_or_else(invalid)?)?)),
            _ => Err(invalid()),
        }
    }
}

/// An attendant event together with the room it came from.
#[derive(Debug, Clone)]
pub struct RoomAttendantEvent {
    pub portal: PublicIdentity,
    pub event: AttendantEvent,
}

/// Consume `room.attendants` from `portal` until the stream ends, publishing
/// every event.
pub async fn follow_attendants(
    portal: &Peer,
    events: &PubSub<RoomAttendantEvent>,
) -> Result<(), RpcError> {
    let request = Request::new(&["room", "attendants"], ProcedureType::Source, json!([]));
    let mut stream = portal.conn().perform_request(request).await?;
    info!(portal = %portal.identity(), "following room attendants");
    while let Some(item) = stream.next_value().await {
        let event = AttendantEvent::parse(&item?)?;
        events.publish(RoomAttendantEvent {
            portal: *portal.identity(),
            event,
        });
    }
    Ok(())
}

/// Open a tunnel to `target` through `portal`. The returned stream carries
/// the raw bytes of the tunneled session.
pub async fn open_tunnel(portal: &Peer, target: &PublicIdentity) -> Result<DuplexStream, RpcError> {
    let request = Request::new(
        &["tunnel", "connect"],
        ProcedureType::Duplex,
        json!([{"portal": portal.identity(), "target": target}]),
    );
    let stream = portal.conn().perform_request(request).await?;
    let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);
    tokio::spawn(bridge_outbound(stream, remote));
    Ok(local)
}

async fn bridge_outbound(mut stream: ResponseStream, io: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(body)) => {
                    if writer.write_all(&body.bytes).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.send(Body::binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = stream.close().await;
    let _ = writer.shutdown().await;
}

async fn bridge_inbound(mut stream: RequestStream, mut response: ResponseWriter, io: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(body)) => {
                    if writer.write_all(&body.bytes).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if response.send(Body::binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = response.end().await;
    let _ = writer.shutdown().await;
}

/// Accepts `tunnel.connect` from a room and runs the server handshake over
/// the tunneled bytes.
pub struct TunnelConnectHandler {
    transport: Arc<Transport>,
    accepted: mpsc::Sender<Peer>,
}

impl TunnelConnectHandler {
    pub fn new(transport: Arc<Transport>, accepted: mpsc::Sender<Peer>) -> Self {
        Self {
            transport,
            accepted,
        }
    }
}

#[async_trait]
impl Handler for TunnelConnectHandler {
    async fn handle(&self, conn: &Connection, mut incoming: IncomingRequest) {
        if incoming.request.typ != ProcedureType::Duplex {
            let _ = incoming.writer.end_with_error("tunnel.connect must be duplex").await;
            return;
        }
        let target = incoming
            .request
            .first_arg()
            .get("target")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<PublicIdentity>().ok());
        if target.is_some_and(|t| t != self.transport.local()) {
            let _ = incoming.writer.end_with_error("tunnel target is not this peer").await;
            return;
        }

        debug!(portal = %conn.remote(), "incoming tunnel");
        let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);
        let IncomingRequest { stream, writer, .. } = incoming;
        tokio::spawn(bridge_inbound(stream, writer, remote));

        match self.transport.upgrade_server(local).await {
            Ok(peer) => {
                if self.accepted.send(peer.clone()).await.is_err() {
                    peer.conn().close();
                }
            }
            Err(e) => debug!(portal = %conn.remote(), error = %e, "tunnel handshake failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attendant_events() {
        let a: PublicIdentity = scuttle_shared::Identity::generate().public();
        assert_eq!(
            AttendantEvent::parse(&json!({"type": "state", "ids": [a]})).unwrap(),
            AttendantEvent::State(vec![a])
        );
        assert_eq!(
            AttendantEvent::parse(&json!({"type": "joined", "id": a})).unwrap(),
            AttendantEvent::Joined(a)
        );
        assert_eq!(
            AttendantEvent::parse(&json!({"type": "left", "id": a})).unwrap(),
            AttendantEvent::Left(a)
        );
        assert!(AttendantEvent::parse(&json!({"type": "other"})).is_err());
    }

    #[tokio::test]
    async fn test_tunnel_through_portal() {
        use crate::mux::Mux;
        use crate::rpc::ProcedureName;
        use scuttle_shared::{Identity, NetworkKey};
        use tokio_util::sync::CancellationToken;

        let root = CancellationToken::new();
        let target_identity = Identity::generate();
        let target_public = target_identity.public();

        // The target serves `tunnel.connect`; in a real room the portal
        // relays the stream, here the target is the portal itself.
        let target_mux = Arc::new(Mux::new());
        let target = Arc::new(Transport::new(
            target_identity,
            NetworkKey::default(),
            target_mux.clone(),
            root.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(1);
        target_mux.add_handler(
            ProcedureName::new(&["tunnel", "connect"]),
            Arc::new(TunnelConnectHandler::new(target.clone(), tx)),
        );

        let client = Transport::new(
            Identity::generate(),
            NetworkKey::default(),
            Arc::new(Mux::new()),
            root.clone(),
        );
        let (client_io, target_io) = tokio::io::duplex(TUNNEL_BUFFER);
        let target_clone = target.clone();
        let portal_side = tokio::spawn(async move { target_clone.upgrade_server(target_io).await });
        let portal = client
            .upgrade_client(client.identity(), client_io, &target_public)
            .await
            .unwrap();
        let _portal_server = portal_side.await.unwrap().unwrap();

        let tunnel = open_tunnel(&portal, &target_public).await.unwrap();
        let tunneled = client
            .upgrade_client(client.identity(), tunnel, &target_public)
            .await
            .unwrap();
        assert_eq!(tunneled.identity(), &target_public);

        let accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.identity(), &client.local());
        root.cancel();
    }
}
