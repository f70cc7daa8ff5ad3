//! Wiring of a running node: storage, transport, handlers, replication and
//! the background tasks that drive them.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scuttle_net::{
    listen_address, serve, Mux, Peer, PeerManager, PeerSupervisor, ProcedureName, PubSub,
    TunnelConnectHandler, Transport,
};
use scuttle_shared::{Identity, PublicIdentity};
use scuttle_store::{BlobStorage, Database};

use crate::app::App;
use crate::blobs::BlobReplicator;
use crate::buffer::MessageBuffer;
use crate::config::NodeConfig;
use crate::replication::FeedReplicator;

/// Accepted peers waiting for the peer manager.
const INBOUND_QUEUE: usize = 64;

/// Runs feed and blob replication side by side for every peer.
struct ReplicationSupervisor {
    feeds: Arc<FeedReplicator>,
    blobs: Arc<BlobReplicator>,
}

#[async_trait]
impl PeerSupervisor for ReplicationSupervisor {
    async fn run(&self, peer: Peer) {
        tokio::join!(self.feeds.replicate(&peer), self.blobs.replicate(&peer));
    }
}

pub struct Node {
    config: NodeConfig,
    app: App,
    transport: Arc<Transport>,
    inbound: mpsc::Sender<Peer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage under the configured data directory, load or create the
    /// identity and start the message buffer and the peer manager. Every
    /// task stops when `cancel` fires.
    pub async fn open(config: NodeConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let db = Arc::new(
            Database::open_in(&config.data_directory).context("Failed to open database")?,
        );
        let identity = Identity::load_or_generate(&config.secret_path())
            .context("Failed to load identity")?;
        info!(feed = %identity.feed(), "local identity");

        let storage = Arc::new(
            BlobStorage::new(config.blobs_path())
                .await
                .context("Failed to open blob storage")?
                .with_max_size(config.blob_max_size),
        );

        let messages = Arc::new(PubSub::new("messages"));
        let buffer = Arc::new(MessageBuffer::new(
            db.clone(),
            identity.feed(),
            config.hops,
            config.buffer.clone(),
            messages.clone(),
        ));
        let feeds = Arc::new(FeedReplicator::new(
            db.clone(),
            identity.feed(),
            config.hops,
            config.message_hmac,
            buffer.clone(),
            messages.clone(),
        ));
        let blobs = Arc::new(BlobReplicator::new(db.clone(), storage));

        let mux = Arc::new(Mux::new());
        feeds.register(&mux);
        blobs.register(&mux);

        let transport = Arc::new(Transport::new(
            identity.clone(),
            config.network_key,
            mux.clone(),
            cancel.clone(),
        ));
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        mux.add_handler(
            ProcedureName::new(&["tunnel", "connect"]),
            Arc::new(TunnelConnectHandler::new(transport.clone(), inbound.clone())),
        );

        let peers = PeerManager::new(
            transport.clone(),
            config.peer_manager.clone(),
            Arc::new(ReplicationSupervisor {
                feeds,
                blobs: blobs.clone(),
            }),
        );

        let tasks = vec![
            tokio::spawn(buffer.run(cancel.clone())),
            tokio::spawn(peers.clone().run(inbound_rx, cancel.clone())),
        ];

        let app = App {
            identity,
            hmac: config.message_hmac,
            hops: config.hops,
            db,
            messages,
            blobs,
            peers,
        };

        Ok(Self {
            config,
            app,
            transport,
            inbound,
            cancel,
            tasks,
        })
    }

    pub fn app(&self) -> App {
        self.app.clone()
    }

    pub fn public(&self) -> PublicIdentity {
        self.transport.local()
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let address = listen_address(&self.config.listen_address);
        TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {address}"))
    }

    /// Accept peers on `listener` until the node shuts down.
    pub fn listen(&mut self, listener: TcpListener) {
        let transport = self.transport.clone();
        let inbound = self.inbound.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = serve(listener, transport, inbound, cancel).await {
                error!(error = %e, "listener failed");
            }
        }));
    }

    /// Cancel every task and wait for them; the message buffer persists
    /// what it can on the way out.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.cancel.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "task failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scuttle_shared::FeedRef;
    use serde_json::json;

    use super::*;

    fn config(dir: &tempfile::TempDir) -> NodeConfig {
        let mut config = NodeConfig {
            data_directory: dir.path().to_path_buf(),
            listen_address: "127.0.0.1:0".to_string(),
            ..NodeConfig::default()
        };
        config.buffer.persist_every = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(config(&dir), CancellationToken::new()).await.unwrap();
        let public = node.public();
        node.app()
            .publish_raw(&json!({"type": "post", "text": "before restart"}))
            .unwrap();
        node.shutdown().await;

        let node = Node::open(config(&dir), CancellationToken::new()).await.unwrap();
        assert_eq!(node.public(), public);
        let messages = node
            .app()
            .feed_messages(&public.into(), None, None)
            .unwrap();
        assert_eq!(messages.len(), 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_nodes_replicate_followed_feeds() {
        let root = CancellationToken::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut alice = Node::open(config(&dir_a), root.child_token()).await.unwrap();
        let bob = Node::open(config(&dir_b), root.child_token()).await.unwrap();

        let listener = alice.bind().await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        alice.listen(listener);

        let alice_app = alice.app();
        for n in 0..3 {
            alice_app
                .publish_raw(&json!({"type": "post", "text": format!("post {n}")}))
                .unwrap();
        }
        let bob_app = bob.app();
        bob_app.follow(&alice.public().into()).unwrap();
        bob_app.connect(&alice.public(), &address).await.unwrap();

        let alice_feed: FeedRef = alice.public().into();
        let mut replicated = 0;
        for _ in 0..200 {
            replicated = bob_app.feed_messages(&alice_feed, None, None).unwrap().len();
            if replicated == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(replicated, 3);
        assert_eq!(bob_app.status().unwrap().peers.len(), 1);

        root.cancel();
        alice.shutdown().await;
        bob.shutdown().await;
    }
}
