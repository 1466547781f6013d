use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_channel::Sender;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::core::RetrySettings;
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::connection::{ConnectionArc, StreamHandleArc, StreamKind};
use crate::firestore::remote::credentials::TokenProviderArc;
use crate::platform::runtime;
use crate::util::async_queue::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;
use crate::util::hard_assert;

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Starting -> ...
///                  \-> Error (open failed)
/// ```
/// `stop()` and idle timeouts return the stream to `Initial`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. Every callback runs on
/// the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait PersistentStreamListener: Send + Sync + 'static {
    async fn on_open(&self) -> FirestoreResult<()>;

    /// An error closes the stream with that error.
    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;

    /// The stream closed because of `error`, or went idle when `None`. Not
    /// called for [`PersistentStream::stop`].
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamInner {
    state: StreamState,
    /// Bumped on every close so callbacks of an earlier connection attempt
    /// can tell they are stale.
    generation: u64,
    handle: Option<StreamHandleArc>,
    outbound: Option<Sender<JsonValue>>,
    backoff: ExponentialBackoff,
    backoff_operation: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
}

/// A stream that reconnects with exponential backoff after errors and
/// closes itself after a period without use.
pub struct PersistentStream {
    kind: StreamKind,
    queue: AsyncQueue,
    connection: ConnectionArc,
    credentials: TokenProviderArc,
    listener: Arc<dyn PersistentStreamListener>,
    idle_timeout: Duration,
    inner: Mutex<StreamInner>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: TokenProviderArc,
        retry: &RetrySettings,
        idle_timeout: Duration,
        listener: Arc<dyn PersistentStreamListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queue,
            connection,
            credentials,
            listener,
            idle_timeout,
            inner: Mutex::new(StreamInner {
                state: StreamState::Initial,
                generation: 0,
                handle: None,
                outbound: None,
                backoff: ExponentialBackoff::new(
                    retry.initial_delay,
                    retry.multiplier,
                    retry.max_delay,
                ),
                backoff_operation: None,
                idle_timer: None,
            }),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// True while connecting, backing off or open.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Backoff | StreamState::Open
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    fn idle_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }

    /// Starts connecting. After an error the attempt waits for the backoff
    /// delay first.
    pub fn start(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.lock();
            match inner.state {
                StreamState::Error => {
                    self.perform_backoff(&mut inner);
                    return;
                }
                StreamState::Initial => {}
                state => {
                    log::debug!("{} stream: start ignored in state {state:?}", self.kind);
                    return;
                }
            }
            inner.state = StreamState::Starting;
            inner.generation
        };

        let stream = Arc::clone(self);
        runtime::spawn_detached(async move {
            let opened = match stream.credentials.get_token(false).await {
                Ok(token) => stream.connection.open_stream(stream.kind, token).await,
                Err(err) => Err(err),
            };
            let queue = stream.queue.clone();
            queue.enqueue_and_forget(box_queue_future(async move {
                stream.on_open_result(generation, opened).await
            }));
        });
    }

    fn perform_backoff(self: &Arc<Self>, inner: &mut StreamInner) {
        inner.state = StreamState::Backoff;
        let delay = inner.backoff.next_delay();
        log::debug!("{} stream: backing off for {delay:?}", self.kind);
        let stream = Arc::clone(self);
        inner.backoff_operation = Some(self.queue.enqueue_after_delay(
            self.backoff_timer_id(),
            delay,
            box_queue_future(async move {
                stream.on_backoff_elapsed();
                Ok(())
            }),
        ));
    }

    fn on_backoff_elapsed(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.state != StreamState::Backoff {
                return;
            }
            inner.backoff_operation = None;
            inner.state = StreamState::Initial;
        }
        self.start();
    }

    async fn on_open_result(
        self: Arc<Self>,
        generation: u64,
        opened: FirestoreResult<StreamHandleArc>,
    ) -> FirestoreResult<()> {
        if self.lock().generation != generation {
            // Stopped while connecting.
            if let Ok(handle) = opened {
                handle.close();
            }
            return Ok(());
        }

        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                log::debug!("{} stream: failed to open: {err}", self.kind);
                return self.close(StreamState::Error, Some(err)).await;
            }
        };

        let (outbound_tx, outbound_rx) = async_channel::unbounded::<JsonValue>();
        {
            let mut inner = self.lock();
            inner.state = StreamState::Open;
            inner.handle = Some(Arc::clone(&handle));
            inner.outbound = Some(outbound_tx);
        }

        let writer = Arc::clone(&handle);
        let kind = self.kind;
        runtime::spawn_detached(async move {
            while let Ok(message) = outbound_rx.recv().await {
                if let Err(err) = writer.send(message).await {
                    log::debug!("{kind} stream: send failed: {err}");
                    break;
                }
            }
        });

        let reader = Arc::clone(&self);
        runtime::spawn_detached(async move {
            reader.read_loop(handle, generation).await;
        });

        log::debug!("{} stream: open", self.kind);
        self.listener.on_open().await
    }

    /// Hands every frame to the queue and waits for it to be processed
    /// before reading the next one.
    async fn read_loop(self: Arc<Self>, handle: StreamHandleArc, generation: u64) {
        loop {
            let frame = handle.next().await;
            let finished = !matches!(frame, Some(Ok(_)));
            let stream = Arc::clone(&self);
            let delivered = self
                .queue
                .enqueue(box_queue_future(async move {
                    stream.on_frame(generation, frame).await
                }))
                .await;
            if finished || delivered.is_err() || self.lock().generation != generation {
                break;
            }
        }
    }

    async fn on_frame(
        self: Arc<Self>,
        generation: u64,
        frame: Option<FirestoreResult<JsonValue>>,
    ) -> FirestoreResult<()> {
        if self.lock().generation != generation {
            return Ok(());
        }
        match frame {
            Some(Ok(message)) => {
                self.lock().backoff.reset();
                if let Err(err) = self.listener.on_message(message).await {
                    log::warn!("{} stream: failed to handle message: {err}", self.kind);
                    return self.close(StreamState::Error, Some(err)).await;
                }
                Ok(())
            }
            Some(Err(err)) => {
                log::debug!("{} stream: closed with error: {err}", self.kind);
                self.close(StreamState::Error, Some(err)).await
            }
            None => {
                log::debug!("{} stream: closed by the backend", self.kind);
                self.close(StreamState::Error, None).await
            }
        }
    }

    /// Queues a message. Only valid while open.
    pub fn write_request(&self, message: JsonValue) {
        let mut inner = self.lock();
        if let Some(timer) = inner.idle_timer.take() {
            timer.cancel();
        }
        match &inner.outbound {
            Some(outbound) => {
                if outbound.try_send(message).is_err() {
                    log::debug!("{} stream: dropping message for a closed stream", self.kind);
                }
            }
            None => log::debug!("{} stream: dropping message, stream not open", self.kind),
        }
    }

    /// After an error, lets the next `start()` connect without waiting for
    /// the backoff delay.
    pub fn inhibit_backoff(&self) {
        let mut inner = self.lock();
        hard_assert(
            !matches!(inner.state, StreamState::Starting | StreamState::Open | StreamState::Backoff),
            "Cannot inhibit backoff of a started stream",
        );
        inner.state = StreamState::Initial;
        inner.backoff.reset();
    }

    /// Schedules an idle close unless something is sent in the meantime.
    pub fn mark_idle(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.state != StreamState::Open || inner.idle_timer.is_some() {
            return;
        }
        let stream = Arc::clone(self);
        inner.idle_timer = Some(self.queue.enqueue_after_delay(
            self.idle_timer_id(),
            self.idle_timeout,
            box_queue_future(async move { stream.on_idle_timeout().await }),
        ));
    }

    async fn on_idle_timeout(self: Arc<Self>) -> FirestoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        log::debug!("{} stream: closing idle stream", self.kind);
        self.close(StreamState::Initial, None).await
    }

    /// Closes the stream without notifying the listener and without
    /// scheduling a reconnect.
    pub fn stop(&self) {
        if self.is_started() {
            self.tear_down(StreamState::Initial, None);
        }
    }

    async fn close(
        &self,
        final_state: StreamState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.tear_down(final_state, error.as_ref());
        self.listener.on_close(error).await
    }

    fn tear_down(&self, final_state: StreamState, error: Option<&FirestoreError>) {
        let (handle, idle_timer, backoff_operation) = {
            let mut inner = self.lock();
            inner.generation += 1;
            if final_state != StreamState::Error {
                inner.backoff.reset();
            } else if let Some(error) = error {
                match error.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::debug!(
                            "{} stream: backend resource exhausted, using maximum backoff",
                            self.kind
                        );
                        inner.backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated => {
                        self.credentials.invalidate_token();
                    }
                    _ => {}
                }
            }
            inner.state = final_state;
            inner.outbound = None;
            (
                inner.handle.take(),
                inner.idle_timer.take(),
                inner.backoff_operation.take(),
            )
        };
        if let Some(timer) = idle_timer {
            timer.cancel();
        }
        if let Some(operation) = backoff_operation {
            operation.cancel();
        }
        if let Some(handle) = handle {
            handle.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated};
    use crate::firestore::remote::connection::{
        JsonStreamHandle, MultiplexedStreamingConnection, StreamHandle,
    };
    use crate::firestore::remote::credentials::{StaticCredentialsProvider, User};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistentStreamListener for RecordingListener {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".to_string());
            Ok(())
        }

        async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(format!("message:{message}"));
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let label = match error {
                Some(err) => format!("close:{}", err.code_str()),
                None => "close".to_string(),
            };
            self.events.lock().unwrap().push(label);
            Ok(())
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        server: MultiplexedConnection,
        credentials: Arc<StaticCredentialsProvider>,
        listener: Arc<RecordingListener>,
        stream: Arc<PersistentStream>,
    }

    fn fixture() -> Fixture {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let queue = AsyncQueue::new();
        let credentials = Arc::new(StaticCredentialsProvider::new(
            User::new("alice"),
            Some("token".to_string()),
        ));
        let listener = Arc::new(RecordingListener::default());
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue.clone(),
            Arc::new(MultiplexedStreamingConnection::new(client_transport)),
            credentials.clone(),
            &RetrySettings::default(),
            Duration::from_secs(60),
            listener.clone(),
        );
        Fixture {
            queue,
            server: MultiplexedConnection::new(server_transport),
            credentials,
            listener,
            stream,
        }
    }

    async fn start(fixture: &Fixture) -> JsonStreamHandle {
        let stream = Arc::clone(&fixture.stream);
        fixture
            .queue
            .enqueue(box_queue_future(async move {
                stream.start();
                Ok(())
            }))
            .await
            .unwrap();
        let accepted = JsonStreamHandle::new(fixture.server.accept_stream().await.unwrap());
        wait_for(|| fixture.stream.is_open()).await;
        accepted
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
    async fn delivers_messages_in_order() {
        let fixture = fixture();
        let server = start(&fixture).await;
        assert_eq!(server.stream().authorization(), Some("Bearer token"));

        server.send(json!({ "n": 1 })).await.unwrap();
        server.send(json!({ "n": 2 })).await.unwrap();
        wait_for(|| fixture.listener.events().len() == 3).await;
        assert_eq!(
            fixture.listener.events(),
            vec!["open", "message:{\"n\":1}", "message:{\"n\":2}"]
        );

        fixture.stream.write_request(json!({ "addTarget": 1 }));
        assert_eq!(server.next().await.unwrap().unwrap(), json!({ "addTarget": 1 }));
    }

    #[tokio::test]
    async fn errors_back_off_before_reconnecting() {
        let fixture = fixture();
        let server = start(&fixture).await;
        server.stream().fail(resource_exhausted("quota")).await.unwrap();
        wait_for(|| fixture.stream.state() == StreamState::Error).await;
        assert_eq!(fixture.listener.events().last().unwrap(), "close:firestore/resource-exhausted");

        let stream = Arc::clone(&fixture.stream);
        fixture
            .queue
            .enqueue(box_queue_future(async move {
                stream.start();
                Ok(())
            }))
            .await
            .unwrap();
        assert_eq!(fixture.stream.state(), StreamState::Backoff);
        assert!(fixture
            .queue
            .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));

        fixture
            .queue
            .run_delayed_operations_until(Some(TimerId::ListenStreamConnectionBackoff))
            .await
            .unwrap();
        let _reconnected = fixture.server.accept_stream().await.unwrap();
        wait_for(|| fixture.stream.is_open()).await;
    }

    #[tokio::test]
    async fn unauthenticated_errors_invalidate_the_token() {
        let fixture = fixture();
        let server = start(&fixture).await;
        server.stream().fail(unauthenticated("expired")).await.unwrap();
        wait_for(|| fixture.stream.state() == StreamState::Error).await;
        assert_eq!(fixture.credentials.invalidation_count(), 1);
    }

    #[tokio::test]
    async fn idle_streams_close_and_stop_is_silent() {
        let fixture = fixture();
        let _server = start(&fixture).await;
        let stream = Arc::clone(&fixture.stream);
        fixture
            .queue
            .enqueue(box_queue_future(async move {
                stream.mark_idle();
                Ok(())
            }))
            .await
            .unwrap();
        fixture
            .queue
            .run_delayed_operations_until(Some(TimerId::ListenStreamIdle))
            .await
            .unwrap();
        assert_eq!(fixture.stream.state(), StreamState::Initial);
        assert_eq!(fixture.listener.events(), vec!["open", "close"]);

        let _server = start(&fixture).await;
        fixture.stream.stop();
        assert_eq!(fixture.stream.state(), StreamState::Initial);
        assert_eq!(fixture.listener.events(), vec!["open", "close", "open"]);
    }
}
