//! Dispatch of inbound procedure calls by name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::rpc::{Connection, IncomingRequest, ProcedureName, RequestHandler};

/// Handler for one procedure.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, conn: &Connection, incoming: IncomingRequest);
}

/// Handler that also wants to know when a connection it served closes.
#[async_trait]
pub trait ClosingHandler: Handler {
    async fn on_close(&self, conn: &Connection);
}

#[derive(Clone)]
enum Entry {
    Plain(Arc<dyn Handler>),
    Closing(Arc<dyn ClosingHandler>),
}

#[derive(Default)]
struct Node {
    entry: Option<Entry>,
    children: HashMap<String, Node>,
}

impl Node {
    fn insert(&mut self, path: &[String], entry: Entry) {
        match path.split_first() {
            None => self.entry = Some(entry),
            Some((head, rest)) => self.children.entry(head.clone()).or_default().insert(rest, entry),
        }
    }

    fn find(&self, path: &[String]) -> Option<&Entry> {
        match path.split_first() {
            None => self.entry.as_ref(),
            Some((head, rest)) => self.children.get(head)?.find(rest),
        }
    }
}

/// A trie of handlers keyed by the parts of the procedure name.
///
/// Handlers may be registered after the mux was handed to connections.
#[derive(Default)]
pub struct Mux {
    root: RwLock<Node>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, name: ProcedureName, handler: Arc<dyn Handler>) {
        self.insert(name, Entry::Plain(handler));
    }

    pub fn add_closing_handler(&self, name: ProcedureName, handler: Arc<dyn ClosingHandler>) {
        self.insert(name, Entry::Closing(handler));
    }

    fn insert(&self, name: ProcedureName, entry: Entry) {
        debug!(procedure = %name, "registering handler");
        let mut root = self.root.write().unwrap_or_else(|p| p.into_inner());
        root.insert(name.parts(), entry);
    }

    fn find(&self, name: &ProcedureName) -> Option<Entry> {
        let root = self.root.read().unwrap_or_else(|p| p.into_inner());
        root.find(name.parts()).cloned()
    }
}

#[async_trait]
impl RequestHandler for Mux {
    async fn handle(&self, conn: Connection, mut incoming: IncomingRequest) {
        match self.find(&incoming.request.name) {
            Some(Entry::Plain(handler)) => handler.handle(&conn, incoming).await,
            Some(Entry::Closing(handler)) => {
                let watcher = handler.clone();
                let watched = conn.clone();
                tokio::spawn(async move {
                    watched.closed().await;
                    watcher.on_close(&watched).await;
                });
                handler.handle(&conn, incoming).await;
            }
            None => {
                debug!(
                    peer = %conn.remote(),
                    procedure = %incoming.request.name,
                    "no handler for procedure"
                );
                let _ = incoming.writer.end_with_error("method not found").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::RpcError;
    use crate::rpc::testing::connected_pair;
    use crate::rpc::{ProcedureType, Request};

    struct CountingSource;

    #[async_trait]
    impl Handler for CountingSource {
        async fn handle(&self, _conn: &Connection, mut incoming: IncomingRequest) {
            for n in 1..=3 {
                let _ = incoming.writer.send_json(&json!({"n": n})).await;
            }
            let _ = incoming.writer.end().await;
        }
    }

    struct CloseCounter(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CloseCounter {
        async fn handle(&self, _conn: &Connection, mut incoming: IncomingRequest) {
            let _ = incoming.writer.send_json(&json!("ok")).await;
        }
    }

    #[async_trait]
    impl ClosingHandler for CloseCounter {
        async fn on_close(&self, _conn: &Connection) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_source_handler_emits_in_order() {
        let mux = Arc::new(Mux::new());
        mux.add_handler(
            ProcedureName::new(&["test", "stream"]),
            Arc::new(CountingSource),
        );
        let (client, _server) = connected_pair(Arc::new(Mux::new()), mux).await;

        let mut stream = client
            .perform_request(Request::new(&["test", "stream"], ProcedureType::Source, json!([])))
            .await
            .unwrap();
        let mut frames = Vec::new();
        while let Some(item) = stream.next_value().await {
            frames.push(item.unwrap());
        }
        assert_eq!(frames, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_unknown_procedure_is_remote_error() {
        let (client, _server) = connected_pair(Arc::new(Mux::new()), Arc::new(Mux::new())).await;
        let err = client
            .call_json(Request::new(&["no", "such"], ProcedureType::Async, json!([])))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote(remote) => {
                assert_eq!(remote.name, "Error");
                assert_eq!(remote.message, "method not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closing_handler_notified() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mux = Arc::new(Mux::new());
        mux.add_closing_handler(
            ProcedureName::new(&["session"]),
            Arc::new(CloseCounter(closed.clone())),
        );
        let (client, server) = connected_pair(Arc::new(Mux::new()), mux).await;

        let value = client
            .call_json(Request::new(&["session"], ProcedureType::Async, json!([])))
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        client.close();
        server.closed().await;
        for _ in 0..50 {
            if closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trie_prefix_is_not_a_match() {
        let mux = Mux::new();
        mux.add_handler(ProcedureName::new(&["blobs", "get"]), Arc::new(CountingSource));
        assert!(mux.find(&ProcedureName::new(&["blobs"])).is_none());
        assert!(mux.find(&ProcedureName::new(&["blobs", "get"])).is_some());
        assert!(mux.find(&ProcedureName::new(&["blobs", "get", "x"])).is_none());
    }
}
