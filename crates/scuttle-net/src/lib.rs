// Transport, RPC and peer lifecycle over TCP with the Secret Handshake.

pub mod boxstream;
mod crypto;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod mux;
pub mod peer;
pub mod peer_manager;
pub mod peers;
pub mod pubsub;
pub mod rooms;
pub mod rpc;
pub mod transport;

pub use boxstream::{BoxKeys, BoxStreamReader, BoxStreamWriter};
pub use discovery::{parse_beacon, DiscoveryCache, MultiserverAddress};
pub use error::{BoxStreamError, HandshakeCause, HandshakeError, NetError, RemoteError, RpcError};
pub use handshake::HandshakeResult;
pub use mux::{ClosingHandler, Handler, Mux};
pub use peer::Peer;
pub use peer_manager::{PeerManager, PeerManagerConfig, PeerSupervisor, PreferredPub};
pub use peers::{ConnectionInfo, Origin, PeerTracker};
pub use pubsub::PubSub;
pub use rooms::{AttendantEvent, RoomAttendantEvent, TunnelConnectHandler};
pub use rpc::{
    Body, BodyType, Connection, IncomingRequest, ProcedureName, ProcedureType, Request,
    RequestHandler, RequestStream, ResponseStream, ResponseWriter,
};
pub use transport::{listen_address, serve, Transport};
