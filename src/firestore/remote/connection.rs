use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::remote::credentials::Token;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamTransport};

/// The two long-lived RPCs the client keeps open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn channel(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.channel())
    }
}

/// One open bidirectional RPC exchanging JSON messages.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()>;

    /// Next message; `None` when the backend closed the stream cleanly.
    async fn next(&self) -> Option<FirestoreResult<JsonValue>>;

    /// Closes the stream without waiting for the backend.
    fn close(&self);
}

pub type StreamHandleArc = Arc<dyn StreamHandle>;

/// Opens streams to the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<Token>,
    ) -> FirestoreResult<StreamHandleArc>;
}

pub type ConnectionArc = Arc<dyn Connection>;

/// [`Connection`] that carries every stream over one multiplexed
/// transport, encoding messages as JSON.
pub struct MultiplexedStreamingConnection {
    connection: MultiplexedConnection,
}

impl MultiplexedStreamingConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            connection: MultiplexedConnection::new(transport),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for MultiplexedStreamingConnection {
    async fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<Token>,
    ) -> FirestoreResult<StreamHandleArc> {
        let authorization = token.map(|token| token.authorization_header());
        let stream = self
            .connection
            .open_stream(kind.channel(), authorization)
            .await?;
        log::debug!("connection: opened {kind} stream {}", stream.id().value());
        Ok(Arc::new(JsonStreamHandle::new(stream)))
    }
}

/// Adapts a byte stream to JSON messages.
pub struct JsonStreamHandle {
    stream: MultiplexedStream,
}

impl JsonStreamHandle {
    pub fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &MultiplexedStream {
        &self.stream
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for JsonStreamHandle {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(&message)
            .map_err(|err| internal_error(format!("failed to encode stream message: {err}")))?;
        self.stream.send(payload).await
    }

    async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        let payload = match self.stream.next().await? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err)),
        };
        Some(
            serde_json::from_slice(&payload)
                .map_err(|err| internal_error(format!("failed to decode stream message: {err}"))),
        )
    }

    fn close(&self) {
        self.stream.close();
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::remote::credentials::User;
    use crate::firestore::remote::stream::InMemoryTransport;
    use serde_json::json;

    #[tokio::test]
    async fn json_messages_cross_the_connection() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let connection = MultiplexedStreamingConnection::new(client_transport);
        let server = MultiplexedConnection::new(server_transport);

        let token = Token::new("secret", User::new("alice"));
        let client = connection
            .open_stream(StreamKind::Write, Some(token))
            .await
            .unwrap();
        let accepted = JsonStreamHandle::new(server.accept_stream().await.unwrap());
        assert_eq!(accepted.stream().channel(), "write");
        assert_eq!(accepted.stream().authorization(), Some("Bearer secret"));

        client.send(json!({ "database": "db" })).await.unwrap();
        let received = accepted.next().await.unwrap().unwrap();
        assert_eq!(received, json!({ "database": "db" }));

        accepted.close();
        assert!(client.next().await.is_none());
    }
}
