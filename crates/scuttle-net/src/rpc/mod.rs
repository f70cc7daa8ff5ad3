//! Request-numbered RPC multiplexing over a box stream.

mod connection;
pub mod frame;
pub mod request;
mod stream;

pub use connection::{Connection, IncomingRequest, RequestHandler, REQUEST_TIMEOUT};
pub use frame::{Body, BodyType, Frame};
pub use request::{ProcedureName, ProcedureType, Request};
pub use stream::{RequestStream, ResponseStream, ResponseWriter};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use scuttle_shared::{Identity, NetworkKey};

    use super::{Connection, RequestHandler};
    use crate::handshake;

    /// Two connected RPC endpoints over an in-memory pipe. The first one is
    /// the dialing side.
    pub(crate) async fn connected_pair(
        client_handler: Arc<dyn RequestHandler>,
        server_handler: Arc<dyn RequestHandler>,
    ) -> (Connection, Connection) {
        let client_id = Identity::generate();
        let server_id = Identity::generate();
        let server_public = server_id.public();
        let key = NetworkKey::default();
        let root = CancellationToken::new();

        let (mut client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let result = handshake::server(&mut server_io, &server_id, &key)
                .await
                .unwrap();
            (server_io, result)
        });
        let client_result = handshake::client(&mut client_io, &client_id, &key, &server_public)
            .await
            .unwrap();
        let (server_io, server_result) = server_task.await.unwrap();

        let client = Connection::start(client_io, client_result, false, client_handler, &root);
        let server = Connection::start(server_io, server_result, true, server_handler, &root);
        (client, server)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::testing::connected_pair;
    use super::*;
    use crate::error::RpcError;

    /// Echoes async calls and counts down source calls.
    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _conn: Connection, mut incoming: IncomingRequest) {
            match incoming.request.typ {
                ProcedureType::Async => {
                    let args = incoming.request.args.clone();
                    let _ = incoming.writer.send_json(&args).await;
                }
                ProcedureType::Source => {
                    for n in (1..=3).rev() {
                        let _ = incoming.writer.send_json(&json!(n)).await;
                    }
                    let _ = incoming.writer.end().await;
                }
                ProcedureType::Duplex | ProcedureType::Sink => {
                    while let Some(Ok(body)) = incoming.stream.next().await {
                        let _ = incoming.writer.send(body).await;
                    }
                    let _ = incoming.writer.end().await;
                }
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _conn: Connection, _incoming: IncomingRequest) {}
    }

    /// Never answers until the connection closes.
    struct Hold;

    #[async_trait]
    impl RequestHandler for Hold {
        async fn handle(&self, _conn: Connection, incoming: IncomingRequest) {
            incoming.writer.context().cancelled().await;
        }
    }

    /// Ends every duplex call right away and counts the calls it saw.
    #[derive(Default)]
    struct EndsFirst {
        calls: AtomicUsize,
        ended: Notify,
    }

    #[async_trait]
    impl RequestHandler for EndsFirst {
        async fn handle(&self, _conn: Connection, mut incoming: IncomingRequest) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = incoming.writer.end().await;
            self.ended.notify_one();
        }
    }

    /// Answers an async call and closes the connection straight after.
    struct AnswerThenClose;

    #[async_trait]
    impl RequestHandler for AnswerThenClose {
        async fn handle(&self, conn: Connection, mut incoming: IncomingRequest) {
            let _ = incoming.writer.send_json(&json!("bye")).await;
            conn.close();
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_async_call_roundtrip() {
        let (client, server) = connected_pair(Arc::new(Silent), Arc::new(Echo)).await;
        assert!(!client.was_initiated_by_remote());
        assert!(server.was_initiated_by_remote());

        let value = client
            .call_json(Request::new(&["echo"], ProcedureType::Async, json!(["hi"])))
            .await
            .unwrap();
        assert_eq!(value, json!(["hi"]));
    }

    #[tokio::test]
    async fn test_source_stream_in_order() {
        let (client, _server) = connected_pair(Arc::new(Silent), Arc::new(Echo)).await;
        let mut stream = client
            .perform_request(Request::new(&["count"], ProcedureType::Source, json!([])))
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(item) = stream.next_value().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![json!(3), json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn test_duplex_echo() {
        let (client, _server) = connected_pair(Arc::new(Silent), Arc::new(Echo)).await;
        let mut stream = client
            .perform_request(Request::new(&["echo"], ProcedureType::Duplex, json!([])))
            .await
            .unwrap();
        stream.send_json(&json!({"a": 1})).await.unwrap();
        assert_eq!(stream.next_value().await.unwrap().unwrap(), json!({"a": 1}));
        stream.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_duplex_caller_keeps_streaming_after_callee_ends() {
        let handler = Arc::new(EndsFirst::default());
        let (client, server) = connected_pair(Arc::new(Silent), handler.clone()).await;
        let mut stream = client
            .perform_request(Request::new(&["ebt", "replicate"], ProcedureType::Duplex, json!([])))
            .await
            .unwrap();
        handler.ended.notified().await;

        // Still our turn to talk; a body shaped like a request must not be
        // taken for a new call.
        stream
            .send_json(&json!({"name": ["ebt", "replicate"], "type": "duplex", "args": []}))
            .await
            .unwrap();
        stream.send_json(&json!({"@feed.ed25519": 2})).await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.next().await.is_none());

        wait_until(|| server.open_streams() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_response_queued_before_close_is_delivered() {
        let (client, server) = connected_pair(Arc::new(Silent), Arc::new(AnswerThenClose)).await;
        let value = client
            .call_json(Request::new(&["bye"], ProcedureType::Async, json!([])))
            .await
            .unwrap();
        assert_eq!(value, json!("bye"));
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (client, server) = connected_pair(Arc::new(Silent), Arc::new(Hold)).await;
        let mut stream = client
            .perform_request(Request::new(&["never"], ProcedureType::Source, json!([])))
            .await
            .unwrap();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(
                        Request::new(&["never"], ProcedureType::Async, json!([])),
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        wait_until(|| client.open_streams() == 2).await;

        client.close();
        assert!(matches!(
            stream.next().await,
            Some(Err(RpcError::ConnectionClosed))
        ));
        assert!(matches!(
            pending.await.unwrap(),
            Err(RpcError::ConnectionClosed)
        ));
        // The goodbye ends the remote's read loop.
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(matches!(
            client
                .perform_request(Request::new(&["x"], ProcedureType::Async, json!([])))
                .await,
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_remote_close_propagates() {
        let (client, server) = connected_pair(Arc::new(Silent), Arc::new(Silent)).await;
        server.close();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(client.is_closed());
    }
}
