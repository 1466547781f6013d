pub mod persistent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use bytes::Bytes;

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub use persistent::{PersistentStream, PersistentStreamListener, StreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Opens a stream on the named RPC channel.
    Open {
        channel: String,
        authorization: Option<String>,
    },
    Data(Bytes),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, channel: impl Into<String>, authorization: Option<String>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open {
                channel: channel.into(),
                authorization,
            },
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Byte pipe carrying frames of many logical streams.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Multiplexes logical streams over one [`StreamTransport`]. Streams are
/// opened by one side with [`open_stream`](Self::open_stream) and show up on
/// the other side through [`accept_stream`](Self::accept_stream).
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted_rx: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            accepted_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(accepted_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, accepted_tx: Sender<MultiplexedStream>) {
        let transport = Arc::clone(&self.transport);
        let streams = Arc::clone(&self.streams);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err}");
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let event = frame.kind().clone();
                let maybe_sender = lock(&streams).get(&stream_id).cloned();
                match (maybe_sender, event) {
                    (None, FrameKind::Open { channel, authorization }) => {
                        let (inbound_tx, inbound_rx) = async_channel::unbounded();
                        lock(&streams).insert(stream_id, inbound_tx);
                        let stream = MultiplexedStream {
                            id: stream_id,
                            channel,
                            authorization,
                            inbound: inbound_rx,
                            manager: handle.clone(),
                        };
                        if accepted_tx.send(stream).await.is_err() {
                            log::debug!("no acceptor for stream {}", stream_id.value());
                        }
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        let _ = sender.send(event).await;
                        lock(&streams).remove(&stream_id);
                    }
                    (Some(sender), event) => {
                        if let Err(err) = sender.send(event).await {
                            log::debug!(
                                "dropping inbound frame for closed stream {}: {err}",
                                stream_id.value()
                            );
                        }
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                }
            }
            // Wake up every reader still waiting on a stream.
            lock(&streams).clear();
        });
    }

    pub async fn open_stream(
        &self,
        channel: &str,
        authorization: Option<String>,
    ) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, channel, authorization.clone()))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            channel: channel.to_string(),
            authorization,
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream. `None` once the transport is
    /// gone.
    pub async fn accept_stream(&self) -> Option<MultiplexedStream> {
        self.accepted_rx.recv().await.ok()
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    /// Tells the peer the stream is gone. No-op if it was already closed.
    pub fn close_stream(&self, stream_id: StreamId) {
        if lock(&self.streams).remove(&stream_id).is_some() {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    channel: String,
    authorization: Option<String>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Authorization header sent when the stream was opened.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub async fn send(&self, payload: impl Into<Bytes>) -> FirestoreResult<()> {
        self.manager
            .outbound_tx
            .send(TransportFrame::data(self.id, payload.into()))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Fails the stream on the peer's side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock(&self.manager.streams).remove(&self.id);
        self.manager
            .outbound_tx
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    /// Next payload; `None` once the stream was closed by either side.
    pub async fn next(&self) -> Option<FirestoreResult<Bytes>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open { .. } => continue,
            }
        }
        None
    }

    pub fn close(&self) {
        self.manager.close_stream(self.id);
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

/// Two connected in-process transports.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("loopback transport recv failed: {err}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::error::{unavailable, FirestoreErrorCode};

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left
            .open_stream("listen", Some("Bearer t".to_string()))
            .await
            .expect("left stream");
        let right_stream = right.accept_stream().await.expect("accepted stream");
        assert_eq!(right_stream.channel(), "listen");
        assert_eq!(right_stream.authorization(), Some("Bearer t"));

        left_stream.send(b"hello".to_vec()).await.expect("left send");
        let payload = right_stream
            .next()
            .await
            .expect("right recv")
            .expect("payload");
        assert_eq!(&payload[..], b"hello");

        right_stream.send(b"world".to_vec()).await.expect("right send");
        let payload = left_stream
            .next()
            .await
            .expect("left recv")
            .expect("payload");
        assert_eq!(&payload[..], b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream("write", None).await.expect("left stream");
        let right_stream = right.accept_stream().await.expect("accepted stream");

        left_stream.close();
        assert!(right_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn peer_errors_reach_the_reader() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream("listen", None).await.expect("left stream");
        let right_stream = right.accept_stream().await.expect("accepted stream");
        right_stream.fail(unavailable("backend restarting")).await.unwrap();

        let err = left_stream.next().await.expect("frame").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }
}
