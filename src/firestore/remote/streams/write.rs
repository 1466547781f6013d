use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::FirestoreSettings;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::connection::{ConnectionArc, StreamKind};
use crate::firestore::remote::credentials::TokenProviderArc;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamListener, StreamState};
use crate::firestore::value::BytesValue;
use crate::util::async_queue::AsyncQueue;
use crate::util::hard_assert;

/// Receives decoded events of the write stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;

    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    /// The backend committed the oldest outstanding batch.
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    /// Token of the last response; every write request echoes it back.
    last_stream_token: BytesValue,
}

/// The write RPC. After a handshake that yields a stream token, batches
/// are sent in order and acknowledged in the same order.
pub struct WriteStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: &FirestoreSettings,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Self {
        let state = Arc::new(Mutex::new(WriteStreamState::default()));
        let decoder = Arc::new(WriteStreamDecoder {
            serializer: serializer.clone(),
            state: Arc::clone(&state),
            listener,
        });
        let stream = PersistentStream::new(
            StreamKind::Write,
            queue,
            connection,
            credentials,
            &settings.retry,
            settings.idle_timeout,
            decoder,
        );
        Self {
            stream,
            serializer,
            state,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Lets the next start skip the backoff delay.
    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Whether the stream that is open, or closed last, finished its
    /// handshake.
    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> BytesValue {
        lock(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: BytesValue) {
        lock(&self.state).last_stream_token = token;
    }

    /// First request on a freshly opened stream.
    pub fn write_handshake(&self) {
        hard_assert(self.is_open(), "Writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete(), "Handshake already completed");
        log::debug!("write stream: sending handshake");
        self.stream.write_request(json!({
            "database": self.serializer.database_name(),
        }));
    }

    /// Sends one batch worth of mutations.
    pub fn write_mutations(&self, mutations: &[Mutation]) {
        hard_assert(self.is_open(), "Writing mutations requires an opened stream");
        hard_assert(
            self.handshake_complete(),
            "Handshake must be complete before writing mutations",
        );
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let stream_token = self.last_stream_token().to_base64();
        self.stream.write_request(json!({
            "streamToken": stream_token,
            "writes": writes,
        }));
    }
}

struct WriteStreamDecoder {
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteStreamState>>,
    listener: Weak<dyn WriteStreamListener>,
}

impl WriteStreamDecoder {
    fn listener(&self) -> Option<Arc<dyn WriteStreamListener>> {
        self.listener.upgrade()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener for WriteStreamDecoder {
    async fn on_open(&self) -> FirestoreResult<()> {
        lock(&self.state).handshake_complete = false;
        match self.listener() {
            Some(listener) => listener.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let token = match message.get("streamToken").and_then(JsonValue::as_str) {
            Some(encoded) => BytesValue::from_base64(encoded)
                .map_err(|err| internal_error(format!("Invalid streamToken: {err}")))?,
            None => BytesValue::default(),
        };
        let was_handshake = {
            let mut state = lock(&self.state);
            state.last_stream_token = token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        let Some(listener) = self.listener() else {
            return Ok(());
        };

        if was_handshake {
            return listener.on_handshake_complete().await;
        }

        let commit_time = message
            .get("commitTime")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| internal_error("Write response is missing commitTime"))?;
        let commit_version = self.serializer.decode_version(commit_time)?;
        let results = self
            .serializer
            .decode_write_results(message.get("writeResults"), commit_version)?;
        listener.on_mutation_result(commit_version, results).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener() {
            Some(listener) => listener.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, DocumentKey};
    use crate::firestore::remote::connection::{
        JsonStreamHandle, MultiplexedStreamingConnection, StreamHandle,
    };
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::FirestoreValue;
    use crate::platform::runtime;
    use crate::util::async_queue::box_queue_future;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        stream: Mutex<Option<Arc<WriteStream>>>,
        handshakes: Mutex<usize>,
        results: Mutex<Vec<(SnapshotVersion, Vec<MutationResult>)>>,
    }

    #[async_trait]
    impl WriteStreamListener for Recorder {
        async fn on_write_stream_open(&self) -> FirestoreResult<()> {
            let stream = self.stream.lock().unwrap().clone();
            if let Some(stream) = stream {
                stream.write_handshake();
            }
            Ok(())
        }

        async fn on_handshake_complete(&self) -> FirestoreResult<()> {
            *self.handshakes.lock().unwrap() += 1;
            Ok(())
        }

        async fn on_mutation_result(
            &self,
            commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
        ) -> FirestoreResult<()> {
            self.results.lock().unwrap().push((commit_version, results));
            Ok(())
        }

        async fn on_write_stream_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn handshake_then_mutations_echo_the_stream_token() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(server_transport);
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn WriteStreamListener> = recorder.clone();
        let stream = Arc::new(WriteStream::new(
            queue.clone(),
            Arc::new(MultiplexedStreamingConnection::new(client_transport)),
            Arc::new(EmptyCredentialsProvider),
            JsonProtoSerializer::new(DatabaseId::for_project("demo")),
            &FirestoreSettings::default(),
            Arc::downgrade(&listener),
        ));
        *recorder.stream.lock().unwrap() = Some(Arc::clone(&stream));

        let starter = Arc::clone(&stream);
        queue
            .enqueue(box_queue_future(async move {
                starter.start();
                Ok(())
            }))
            .await
            .unwrap();
        let accepted = JsonStreamHandle::new(server.accept_stream().await.unwrap());
        assert_eq!(accepted.stream().channel(), "write");

        let handshake = accepted.next().await.unwrap().unwrap();
        assert_eq!(
            handshake,
            json!({ "database": "projects/demo/databases/(default)" })
        );
        accepted
            .send(json!({ "streamToken": BytesValue::from(vec![1u8, 2]).to_base64() }))
            .await
            .unwrap();
        wait_for(|| *recorder.handshakes.lock().unwrap() == 1).await;
        assert!(stream.handshake_complete());

        let key = DocumentKey::from_string("rooms/eros").unwrap();
        stream.write_mutations(&[Mutation::delete(key)]);
        let request = accepted.next().await.unwrap().unwrap();
        assert_eq!(
            request["streamToken"],
            json!(BytesValue::from(vec![1u8, 2]).to_base64())
        );
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));

        accepted
            .send(json!({
                "streamToken": BytesValue::from(vec![3u8]).to_base64(),
                "commitTime": "2024-01-01T00:00:02Z",
                "writeResults": [
                    { "transformResults": [ { "stringValue": "ok" } ] }
                ]
            }))
            .await
            .unwrap();
        wait_for(|| !recorder.results.lock().unwrap().is_empty()).await;

        let (commit_version, results) = recorder.results.lock().unwrap()[0].clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, commit_version);
        assert_eq!(
            results[0].transform_results,
            vec![FirestoreValue::from_string("ok")]
        );
        assert_eq!(stream.last_stream_token(), BytesValue::from(vec![3u8]));
    }
}
