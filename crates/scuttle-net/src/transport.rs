//! TCP dialer and listener, both routed through the handshake and RPC setup.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scuttle_shared::{Identity, NetworkKey, PublicIdentity};

use crate::error::{NetError, Result};
use crate::handshake;
use crate::peer::Peer;
use crate::rpc::{Connection, RequestHandler};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to turn a byte stream into a [`Peer`].
pub struct Transport {
    identity: Identity,
    network_key: NetworkKey,
    handler: Arc<dyn RequestHandler>,
    root: CancellationToken,
}

impl Transport {
    pub fn new(
        identity: Identity,
        network_key: NetworkKey,
        handler: Arc<dyn RequestHandler>,
        root: CancellationToken,
    ) -> Self {
        Self {
            identity,
            network_key,
            handler,
            root,
        }
    }

    pub fn local(&self) -> PublicIdentity {
        self.identity.public()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn network_key(&self) -> &NetworkKey {
        &self.network_key
    }

    pub async fn dial(&self, remote: &PublicIdentity, address: &str) -> Result<Peer> {
        self.dial_as(&self.identity, remote, address).await
    }

    /// Dial using `identity` instead of the local one (invite redemption).
    pub async fn dial_as(
        &self,
        identity: &Identity,
        remote: &PublicIdentity,
        address: &str,
    ) -> Result<Peer> {
        let address = dial_address(address)?;
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dialing {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!(peer = %remote, addr = %address, "dialed");
        self.upgrade_client(identity, stream, remote).await
    }

    /// Client handshake over an arbitrary stream, then start RPC.
    pub async fn upgrade_client<S>(
        &self,
        identity: &Identity,
        mut io: S,
        remote: &PublicIdentity,
    ) -> Result<Peer>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = handshake::client(&mut io, identity, &self.network_key, remote).await?;
        let conn = Connection::start(io, result, false, self.handler.clone(), &self.root);
        Ok(Peer::new(conn))
    }

    /// Server handshake over an arbitrary stream, then start RPC.
    pub async fn upgrade_server<S>(&self, mut io: S) -> Result<Peer>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = handshake::server(&mut io, &self.identity, &self.network_key).await?;
        let conn = Connection::start(io, result, true, self.handler.clone(), &self.root);
        Ok(Peer::new(conn))
    }
}

/// `:8008` listens on every interface.
pub fn listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

fn dial_address(address: &str) -> Result<String> {
    match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            Ok(format!("{host}:{port}"))
        }
        _ => Err(NetError::InvalidAddress(address.to_string())),
    }
}

/// Accept TCP connections until `cancel` fires, handing every peer that
/// completes the handshake to `accepted`.
pub async fn serve(
    listener: TcpListener,
    transport: Arc<Transport>,
    accepted: mpsc::Sender<Peer>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let transport = transport.clone();
        let accepted = accepted.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(addr = %addr, error = %e, "set_nodelay failed");
            }
            match transport.upgrade_server(stream).await {
                Ok(peer) => {
                    debug!(peer = %peer.identity(), addr = %addr, "accepted");
                    if accepted.send(peer.clone()).await.is_err() {
                        peer.conn().close();
                    }
                }
                Err(e) => debug!(addr = %addr, error = %e, "inbound handshake failed"),
            }
        });
    }
    info!("listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Mux;

    fn transport(identity: Identity, root: &CancellationToken) -> Arc<Transport> {
        Arc::new(Transport::new(
            identity,
            NetworkKey::default(),
            Arc::new(Mux::new()),
            root.clone(),
        ))
    }

    #[test]
    fn test_addresses() {
        assert_eq!(listen_address(":8008"), "0.0.0.0:8008");
        assert_eq!(listen_address("127.0.0.1:1"), "127.0.0.1:1");
        assert_eq!(dial_address(":8008").unwrap(), "127.0.0.1:8008");
        assert_eq!(dial_address("example.org:8008").unwrap(), "example.org:8008");
        assert!(dial_address("example.org").is_err());
    }

    #[tokio::test]
    async fn test_dial_and_accept_over_tcp() {
        let root = CancellationToken::new();
        let server_identity = Identity::generate();
        let server_public = server_identity.public();
        let server = transport(server_identity, &root);
        let client_identity = Identity::generate();
        let client_public = client_identity.public();
        let client = transport(client_identity, &root);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(serve(listener, server, tx, root.clone()));

        let peer = client.dial(&server_public, &address).await.unwrap();
        assert_eq!(peer.identity(), &server_public);
        assert!(!peer.conn().was_initiated_by_remote());

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.identity(), &client_public);
        assert!(inbound.conn().was_initiated_by_remote());
        root.cancel();
    }
}
