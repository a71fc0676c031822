use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::connection::{Connection, StreamHandle, StreamKind, StreamTokens};

const LOG_TARGET: &str = "firestore::in_memory_connection";

/// Loopback [`Connection`] whose server side is driven by the caller.
///
/// Every stream the client opens is handed out through
/// [`InMemoryConnection::accept`], which lets tests play the backend.
pub struct InMemoryConnection {
    listen: (Sender<ServerStream>, Receiver<ServerStream>),
    write: (Sender<ServerStream>, Receiver<ServerStream>),
    pending_failures: Mutex<Vec<FirestoreError>>,
    tokens: Mutex<Vec<StreamTokens>>,
}

impl InMemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listen: async_channel::unbounded(),
            write: async_channel::unbounded(),
            pending_failures: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        })
    }

    /// Waits for the client to open a stream of `kind`.
    pub async fn accept(&self, kind: StreamKind) -> FirestoreResult<ServerStream> {
        let receiver = match kind {
            StreamKind::Listen => &self.listen.1,
            StreamKind::Write => &self.write.1,
        };
        receiver
            .recv()
            .await
            .map_err(|_| unavailable("in-memory connection closed"))
    }

    /// Streams opened but not yet accepted.
    pub fn pending_streams(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Listen => self.listen.1.len(),
            StreamKind::Write => self.write.1.len(),
        }
    }

    /// Makes the next open attempt fail with `error`.
    pub async fn fail_next_open(&self, error: FirestoreError) {
        self.pending_failures.lock().await.push(error);
    }

    /// Tokens presented by every open attempt so far.
    pub async fn tokens(&self) -> Vec<StreamTokens> {
        self.tokens.lock().await.clone()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_stream(&self, kind: StreamKind, tokens: StreamTokens) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.tokens.lock().await.push(tokens);
        if let Some(error) = self.pending_failures.lock().await.pop() {
            log::debug!(target: LOG_TARGET, "failing {kind} stream open: {error}");
            return Err(error);
        }

        let (to_server, from_client) = async_channel::unbounded();
        let (to_client, from_server) = async_channel::unbounded();
        let server = ServerStream {
            to_client,
            from_client,
        };
        let sender = match kind {
            StreamKind::Listen => &self.listen.0,
            StreamKind::Write => &self.write.0,
        };
        sender
            .send(server)
            .await
            .map_err(|_| unavailable("in-memory connection closed"))?;
        Ok(Arc::new(InMemoryStreamHandle {
            outbound: to_server,
            inbound: from_server,
        }))
    }
}

struct InMemoryStreamHandle {
    outbound: Sender<JsonValue>,
    inbound: Receiver<FirestoreResult<JsonValue>>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for InMemoryStreamHandle {
    fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(message)
            .map_err(|_| unavailable("stream is closed"))
    }

    async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        self.inbound.recv().await.ok()
    }

    fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

/// Backend end of a stream opened on an [`InMemoryConnection`].
pub struct ServerStream {
    to_client: Sender<FirestoreResult<JsonValue>>,
    from_client: Receiver<JsonValue>,
}

impl ServerStream {
    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.to_client
            .try_send(Ok(message))
            .map_err(|_| unavailable("client closed the stream"))
    }

    /// Ends the stream with `error` as seen by the client.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.to_client.try_send(Err(error));
        self.to_client.close();
    }

    /// Ends the stream without an error.
    pub fn close(&self) {
        self.to_client.close();
    }

    /// Next request sent by the client; `None` after the client closed.
    pub async fn next_request(&self) -> Option<JsonValue> {
        self.from_client.recv().await.ok()
    }

    /// Requests already received and not yet read.
    pub fn drain_requests(&self) -> Vec<JsonValue> {
        let mut requests = Vec::new();
        while let Ok(request) = self.from_client.try_recv() {
            requests.push(request);
        }
        requests
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.from_client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, FirestoreErrorCode};
    use serde_json::json;

    #[tokio::test]
    async fn messages_flow_in_both_directions() {
        let connection = InMemoryConnection::new();
        let client = connection
            .open_stream(
                StreamKind::Listen,
                StreamTokens {
                    auth_token: Some("token".into()),
                    app_check_token: None,
                },
            )
            .await
            .unwrap();
        let server = connection.accept(StreamKind::Listen).await.unwrap();

        client.send(json!({"ping": 1})).unwrap();
        assert_eq!(server.next_request().await, Some(json!({"ping": 1})));

        server.send(json!({"pong": 1})).unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), json!({"pong": 1}));
        assert_eq!(connection.tokens().await[0].auth_token.as_deref(), Some("token"));

        server.close();
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_failures_reject_the_open() {
        let connection = InMemoryConnection::new();
        connection.fail_next_open(resource_exhausted("slow down")).await;
        let error = match connection.open_stream(StreamKind::Write, StreamTokens::default()).await {
            Err(error) => error,
            Ok(_) => panic!("open should fail"),
        };
        assert_eq!(error.code, FirestoreErrorCode::ResourceExhausted);
        assert!(connection.open_stream(StreamKind::Write, StreamTokens::default()).await.is_ok());
    }

    #[tokio::test]
    async fn client_close_is_visible_to_server() {
        let connection = InMemoryConnection::new();
        let client = connection.open_stream(StreamKind::Write, StreamTokens::default()).await.unwrap();
        let server = connection.accept(StreamKind::Write).await.unwrap();
        client.close();
        assert!(server.is_closed_by_client());
        assert!(server.next_request().await.is_none());
        assert!(client.send(json!({})).is_err());
    }
}
