use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use once_cell::sync::OnceCell;

use crate::firestore::core::{FirestoreSettings, OnlineState};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::connection::ConnectionArc;
use crate::firestore::remote::connectivity_monitor::{ConnectivityMonitorArc, NetworkStatus};
use crate::firestore::remote::credentials::{TokenProviderArc, User};
use crate::firestore::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    WatchStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::value::BytesValue;
use crate::util::async_queue::{box_queue_future, AsyncQueue};

/// Batches sent to the backend but not yet acknowledged.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams down. The network is used
/// only while none applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    ConnectivityChange,
    Shutdown,
}

#[derive(Default)]
struct RemoteStoreState {
    /// Targets the backend should watch, with the latest resume token.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream runs.
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

struct TargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for TargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the watch and write streams.
///
/// Listens registered here are (re)sent whenever the watch stream opens,
/// resuming from their last resume token. Watch changes are folded into
/// [`RemoteEvent`](crate::firestore::remote::RemoteEvent)s at every
/// consistent snapshot and handed to the [`RemoteSyncer`]. Pending batches
/// of the local mutation queue are pipelined into the write stream.
///
/// Every method is expected to run on the client's async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    local_store: Arc<LocalStore>,
    database_id: DatabaseId,
    state: Mutex<RemoteStoreState>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    connectivity_monitor: ConnectivityMonitorArc,
    syncer: OnceCell<Weak<dyn RemoteSyncer>>,
}

impl RemoteStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_store: Arc<LocalStore>,
        serializer: JsonProtoSerializer,
        connection: ConnectionArc,
        credentials: TokenProviderArc,
        connectivity_monitor: ConnectivityMonitorArc,
        queue: AsyncQueue,
        settings: &FirestoreSettings,
        online_state_handler: OnlineStateHandler,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_listener: Weak<dyn WatchStreamListener> = weak.clone();
            let write_listener: Weak<dyn WriteStreamListener> = weak.clone();
            RemoteStoreInner {
                local_store,
                database_id: serializer.database_id().clone(),
                state: Mutex::new(RemoteStoreState::default()),
                watch_stream: WatchStream::new(
                    queue.clone(),
                    Arc::clone(&connection),
                    Arc::clone(&credentials),
                    serializer.clone(),
                    settings,
                    watch_listener,
                ),
                write_stream: WriteStream::new(
                    queue.clone(),
                    connection,
                    credentials,
                    serializer,
                    settings,
                    write_listener,
                ),
                online_state_tracker: OnlineStateTracker::new(
                    queue.clone(),
                    settings.online_state_timeout,
                    online_state_handler,
                ),
                connectivity_monitor,
                syncer: OnceCell::new(),
            }
        });

        let weak = Arc::downgrade(&inner);
        inner
            .connectivity_monitor
            .add_callback(Arc::new(move |status: NetworkStatus| {
                let weak = weak.clone();
                queue.enqueue_and_forget(box_queue_future(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.handle_network_status(status).await,
                        None => Ok(()),
                    }
                }));
            }));

        Self { inner }
    }

    /// Wires the component that receives remote events. Must be called
    /// once, before [`start`](Self::start).
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        if self.inner.syncer.set(syncer).is_err() {
            log::warn!("remote store: syncer already set");
        }
    }

    /// Starts using the network.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.inner.enable_network_internal().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Tears the streams down and reports `Offline` until re-enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) {
        log::debug!("remote store: shutting down");
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.connectivity_monitor.shutdown();
        self.inner.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Starts watching `target_data`. Listening to a target id twice is a
    /// no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    /// Stops watching `target_id`.
    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Moves newly written batches from the mutation queue into the write
    /// pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts the streams for `user` after the syncer switched over.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.offline_causes.is_empty()
    }

    pub async fn write_pipeline_len(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }

    pub fn is_watch_stream_open(&self) -> bool {
        self.inner.watch_stream.is_open()
    }

    pub fn is_write_stream_open(&self) -> bool {
        self.inner.write_stream.is_open()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("Remote store has no syncer"))
    }

    fn can_use_network(state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        Self::can_use_network(state)
            && !self.watch_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        Self::can_use_network(state)
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if !Self::can_use_network(&state) {
                return Ok(());
            }
            if self.should_start_watch_stream(&state) {
                self.start_watch_stream(&mut state);
            } else {
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "remote store: stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
    }

    async fn restart_network(&self) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Unknown);
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal().await
    }

    async fn handle_network_status(&self, status: NetworkStatus) -> FirestoreResult<()> {
        let was_down = self
            .state
            .lock()
            .await
            .offline_causes
            .contains(&OfflineCause::ConnectivityChange);
        match status {
            NetworkStatus::Unavailable => {
                if was_down {
                    return Ok(());
                }
                log::debug!("remote store: network unavailable, stopping streams");
                self.state
                    .lock()
                    .await
                    .offline_causes
                    .insert(OfflineCause::ConnectivityChange);
                self.disable_network_internal().await;
                self.online_state_tracker.set(OnlineState::Offline);
                Ok(())
            }
            NetworkStatus::Available if was_down => {
                log::debug!("remote store: network available, resuming streams");
                self.state
                    .lock()
                    .await
                    .offline_causes
                    .remove(&OfflineCause::ConnectivityChange);
                self.enable_network_internal().await
            }
            NetworkStatus::Available => {
                if !self.state.lock().await.offline_causes.is_empty() {
                    return Ok(());
                }
                log::debug!("remote store: restarting streams for network reachability change");
                self.restart_network().await
            }
        }
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("remote store: restarting streams for new credentials");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Unknown);
        self.syncer()?.handle_credential_change(user).await?;
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    // Watch stream

    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let mut state = self.state.lock().await;
        let target_id = target_data.target_id;
        if state.listen_targets.contains_key(&target_id) {
            return Ok(());
        }
        state.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream(&state) {
            self.start_watch_stream(&mut state);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&mut state, syncer.as_ref(), &target_data);
        }
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.listen_targets.remove(&target_id);
        if self.watch_stream.is_open() {
            self.send_unwatch_request(&mut state, target_id);
        }

        if state.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if Self::can_use_network(&state) {
                // Nothing left to wait for.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.watch_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    /// Resumed targets carry the number of documents the client believes
    /// match, so the backend can detect removals it missed.
    fn send_watch_request(
        &self,
        state: &mut RemoteStoreState,
        syncer: &dyn RemoteSyncer,
        target_data: &TargetData,
    ) {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        if !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min()
        {
            let expected_count = syncer
                .get_remote_keys_for_target(target_data.target_id)
                .len() as i32;
            self.watch_stream
                .watch(&target_data.with_expected_count(expected_count));
        } else {
            self.watch_stream.watch(target_data);
        }
    }

    fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id);
    }

    async fn on_watch_stream_open_internal(&self) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let mut state = self.state.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(&mut state, syncer.as_ref(), target_data);
        }
        Ok(())
    }

    async fn on_watch_change_internal(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        // Any message proves the connection works.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove && target_change.cause.is_some() {
                return self.handle_target_error(target_change).await;
            }
        }

        let syncer = self.syncer()?;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = TargetMetadata {
                listen_targets: &state.listen_targets,
                syncer: syncer.as_ref(),
            };
            match change {
                WatchChange::DocumentChange(change) => {
                    aggregator.handle_document_change(change, &metadata)
                }
                WatchChange::DocumentDelete(change) => {
                    aggregator.handle_document_delete(change, &metadata)
                }
                WatchChange::DocumentRemove(change) => {
                    aggregator.handle_document_remove(change, &metadata)
                }
                WatchChange::ExistenceFilter(filter) => {
                    aggregator.handle_existence_filter(&filter, &metadata)
                }
                WatchChange::TargetChange(change) => {
                    aggregator.handle_target_change(&change, &metadata)
                }
            }
        }

        if snapshot_version == SnapshotVersion::min() {
            return Ok(());
        }
        let last_remote_version = self.local_store.get_last_remote_snapshot_version()?;
        if snapshot_version >= last_remote_version {
            // Older versions were already applied after a reconnect.
            self.raise_watch_snapshot(snapshot_version, syncer).await?;
        }
        Ok(())
    }

    /// Emits everything aggregated up to `snapshot_version` as one event.
    async fn raise_watch_snapshot(
        &self,
        snapshot_version: SnapshotVersion,
        syncer: Arc<dyn RemoteSyncer>,
    ) -> FirestoreResult<()> {
        let event = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = TargetMetadata {
                listen_targets: &state.listen_targets,
                syncer: syncer.as_ref(),
            };
            let event = aggregator.create_remote_event(snapshot_version, &metadata);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                    *target_data =
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            // Existence filter mismatches: forget the resume token and ask
            // for the target from scratch.
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.get(target_id).cloned() else {
                    continue;
                };
                state.listen_targets.insert(
                    *target_id,
                    target_data.with_resume_token(BytesValue::default(), target_data.snapshot_version),
                );
                self.send_unwatch_request(state, *target_id);
                let request = TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                );
                self.send_watch_request(state, syncer.as_ref(), &request);
            }
            event
        };

        syncer.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause.clone() else {
            return Ok(());
        };
        let syncer = self.syncer()?;
        for target_id in &change.target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if removed {
                log::debug!("remote store: target {target_id} rejected: {error}");
                syncer.reject_listen(*target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close_internal(
        &self,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.watch_aggregator = None;
        if self.should_start_watch_stream(&state) {
            self.online_state_tracker
                .handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream(&mut state);
        } else {
            // No targets left, or the network is disabled on purpose.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    // Write stream

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let mut last_batch_id = state.write_pipeline.back().map(|batch| batch.batch_id);
        while Self::can_use_network(&state) && state.write_pipeline.len() < MAX_PENDING_WRITES {
            match self.local_store.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(&mut state, batch);
                }
                None => {
                    if state.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&batch.mutations);
        }
        state.write_pipeline.push_back(batch);
    }

    async fn on_write_handshake_complete_internal(&self) -> FirestoreResult<()> {
        let state = self.state.lock().await;
        for batch in &state.write_pipeline {
            self.write_stream.write_mutations(&batch.mutations);
        }
        Ok(())
    }

    async fn on_mutation_result_internal(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Got a write result without a pending batch"))?;
        let result = MutationBatchResult::new(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        );
        self.syncer()?.apply_successful_write(result).await?;
        // The acknowledged batch may have been holding back newer ones.
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close_internal(
        &self,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(error) = error else {
            // Idle close.
            return Ok(());
        };
        if self.state.lock().await.write_pipeline.is_empty() {
            return Ok(());
        }

        if self.write_stream.handshake_complete() {
            self.handle_write_error(error).await?;
        } else {
            self.handle_handshake_error(&error);
        }

        let state = self.state.lock().await;
        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    fn handle_handshake_error(&self, error: &FirestoreError) {
        if error.code.is_permanent() {
            log::debug!("remote store: write stream handshake failed, resetting stream token: {error}");
            self.write_stream.set_last_stream_token(BytesValue::default());
        }
    }

    /// Only permanent errors reject the batch. Everything else is retried
    /// when the stream reconnects.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.code.is_permanent_write_error() {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        log::debug!(
            "remote store: batch {} rejected by the backend: {error}",
            batch.batch_id
        );
        // The batch is gone, so the next batch does not need to wait.
        self.write_stream.inhibit_backoff();
        self.syncer()?
            .reject_failed_write(batch.batch_id, error)
            .await?;
        self.fill_write_pipeline().await
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamListener for RemoteStoreInner {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        self.on_watch_stream_open_internal().await
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.on_watch_change_internal(change, snapshot_version).await
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.on_watch_stream_close_internal(error).await
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for RemoteStoreInner {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake();
        Ok(())
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        self.on_write_handshake_complete_internal().await
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        self.on_mutation_result_internal(commit_version, results).await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.on_write_stream_close_internal(error).await
    }
}
