use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::FirestoreSettings;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{SnapshotVersion, TargetId};
use crate::firestore::remote::connection::{ConnectionArc, StreamKind};
use crate::firestore::remote::credentials::TokenProviderArc;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamListener, StreamState};
use crate::firestore::remote::watch_change::{
    decode_snapshot_version, decode_watch_change, WatchChange,
};
use crate::util::async_queue::AsyncQueue;

/// Receives decoded events of the watch stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The listen RPC: registers targets and delivers their changes.
pub struct WatchStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: &FirestoreSettings,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Self {
        let decoder = Arc::new(WatchStreamDecoder {
            serializer: serializer.clone(),
            listener,
        });
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue,
            connection,
            credentials,
            &settings.retry,
            settings.idle_timeout,
            decoder,
        );
        Self { stream, serializer }
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

    /// Asks the backend to start sending changes for `target_data`.
    pub fn watch(&self, target_data: &TargetData) {
        log::debug!("watch stream: adding target {}", target_data.target_id);
        let target = self.serializer.encode_target(target_data);
        self.stream.write_request(json!({
            "database": self.serializer.database_name(),
            "addTarget": target,
        }));
    }

    pub fn unwatch(&self, target_id: TargetId) {
        log::debug!("watch stream: removing target {target_id}");
        self.stream.write_request(json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        }));
    }
}

struct WatchStreamDecoder {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener for WatchStreamDecoder {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let Some(change) = decode_watch_change(&self.serializer, &message)? else {
            log::debug!("watch stream: ignoring unknown response {message}");
            return Ok(());
        };
        let snapshot_version = decode_snapshot_version(&self.serializer, &message)?;
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::connection::{
        JsonStreamHandle, MultiplexedStreamingConnection, StreamHandle,
    };
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::remote::watch_change::TargetChangeState;
    use crate::util::async_queue::box_queue_future;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
        opened: Mutex<bool>,
    }

    #[async_trait]
    impl WatchStreamListener for Recorder {
        async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
            *self.opened.lock().unwrap() = true;
            Ok(())
        }

        async fn on_watch_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> FirestoreResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_stream_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn watch_sends_add_target_and_decodes_changes() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(server_transport);
        let queue = AsyncQueue::new();
        let serializer = JsonProtoSerializer::new(DatabaseId::for_project("demo"));
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn WatchStreamListener> = recorder.clone();
        let stream = Arc::new(WatchStream::new(
            queue.clone(),
            Arc::new(MultiplexedStreamingConnection::new(client_transport)),
            Arc::new(EmptyCredentialsProvider),
            serializer,
            &FirestoreSettings::default(),
            Arc::downgrade(&listener),
        ));

        let starter = Arc::clone(&stream);
        queue
            .enqueue(box_queue_future(async move {
                starter.start();
                Ok(())
            }))
            .await
            .unwrap();
        let accepted = JsonStreamHandle::new(server.accept_stream().await.unwrap());
        assert_eq!(accepted.stream().channel(), "listen");
        while !*recorder.opened.lock().unwrap() {
            crate::platform::runtime::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(stream.is_open());

        let query = Query::collection("rooms").unwrap();
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1);
        stream.watch(&target_data);
        let request = accepted.next().await.unwrap().unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert_eq!(
            request["database"],
            json!("projects/demo/databases/(default)")
        );

        accepted
            .send(json!({
                "targetChange": {
                    "targetChangeType": "CURRENT",
                    "targetIds": [],
                    "readTime": "2024-01-01T00:00:01Z"
                }
            }))
            .await
            .unwrap();
        while recorder.changes.lock().unwrap().is_empty() {
            crate::platform::runtime::sleep(std::time::Duration::from_millis(5)).await;
        }
        let (change, version) = recorder.changes.lock().unwrap()[0].clone();
        match change {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, TargetChangeState::Current)
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert!(version > SnapshotVersion::min());
    }
}
