use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::channel::oneshot;

use crate::firestore::core::{
    LimboDocumentChange, OnlineState, Query, TargetIdGenerator, View, ViewChange, ViewSnapshot,
};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose,
    BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::{
    box_remote_store_future, RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer,
    TargetChange, User,
};
use crate::util::hard_assert;

/// Resolves once a write was acknowledged or rejected by the backend.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receives the output of the sync engine. Implemented by the event manager.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the target of `query`; its view is gone.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A document in limbo and whether the backend already sent it on its
/// limbo target.
struct LimboResolution {
    key: DocumentKey,
    received_document: bool,
}

/// Remote store calls collected while the state lock is held and issued
/// once it is released.
enum RemoteRequest {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    query_views_by_query: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views currently consider a document in limbo.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_user_callbacks: BTreeMap<User, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
}

/// Ties the local store, the remote store and the query views together.
///
/// User listens become views over the local store plus watch targets; user
/// writes go to the local store first and then to the write pipeline.
/// Documents that a view shows but the backend no longer reports for its
/// target are "in limbo" and get resolved through dedicated document
/// targets, at most `max_concurrent_limbo_resolutions` at a time.
///
/// Every method runs on the async queue. The state lock is never held
/// across a call into the remote store.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_store,
            remote_store,
            max_concurrent_limbo_resolutions,
            listener: Mutex::new(None),
            state: Mutex::new(SyncEngineState {
                current_user,
                online_state: OnlineState::Unknown,
                query_views_by_query: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *lock(&self.listener) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncEngineState> {
        lock(&self.state)
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Starts a view for `query` and returns its first snapshot. Queries
    /// sharing a target share the remote listen.
    pub async fn listen(
        &self,
        query: &Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        {
            let state = self.lock_state();
            if let Some(query_view) = state.query_views_by_query.get(&canonical_id) {
                return Ok(query_view.view.compute_initial_snapshot());
            }
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let (snapshot, requests) =
            self.initialize_view_and_compute_snapshot(query, &target_data)?;
        if should_listen_to_remote {
            self.remote_store.listen(target_data).await?;
        }
        self.execute_remote_requests(requests).await?;
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        query: &Query,
        target_data: &TargetData,
    ) -> FirestoreResult<(ViewSnapshot, Vec<RemoteRequest>)> {
        let target_id = target_data.target_id;
        let query_result = self.local_store.execute_query(query, true)?;

        let mut state = self.lock_state();
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        // New targets start out not current; a cached resume token still
        // marks the results as backed by an earlier sync.
        let synthesized = TargetChange::synthesized_for_current_change(
            false,
            target_data.resume_token.clone(),
        );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);

        let mut requests = Vec::new();
        self.update_tracked_limbos(&mut state, target_id, view_change.limbo_changes, &mut requests);
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("First view computation produced no snapshot"))?;

        state.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        Ok((snapshot, requests))
    }

    /// Resumes the remote listen of a view that so far only served the
    /// cache.
    pub async fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        self.require_query_view(query)?;
        let target_data = self.local_store.allocate_target(query.to_target())?;
        self.remote_store.listen(target_data).await
    }

    /// Drops the view for `query`. The target is released once no other
    /// query maps onto it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.lock_state();
            let Some(target_id) = state
                .query_views_by_query
                .get(&canonical_id)
                .map(|query_view| query_view.target_id)
            else {
                log::debug!("sync engine: unlisten for unknown query {canonical_id}");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views_by_query.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        self.local_store.release_target(target_id, false)?;
        if should_unlisten_remote {
            self.remote_store.unlisten(target_id).await?;
        }
        let (requests, _) = self.remove_and_cleanup_target(target_id, None);
        self.execute_remote_requests(requests).await
    }

    /// Stops the remote listen for `query` but keeps serving its view from
    /// the cache.
    pub async fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target_id = self.require_query_view(query)?;
        let shared = {
            let state = self.lock_state();
            state
                .queries_by_target
                .get(&target_id)
                .map_or(0, Vec::len)
                > 1
        };
        if !shared {
            self.remote_store.unlisten(target_id).await?;
        }
        Ok(())
    }

    fn require_query_view(&self, query: &Query) -> FirestoreResult<TargetId> {
        self.lock_state()
            .query_views_by_query
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
            .ok_or_else(|| {
                internal_error(format!("No view for query {}", query.canonical_id()))
            })
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// callback resolves once the batch is acknowledged or rejected, or
    /// right away when the local write fails.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("sync engine: failed to persist write: {err}");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };

        {
            let mut state = self.lock_state();
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, callback);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Resolves `callback` once every write issued so far is acknowledged
    /// or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "sync engine: the network is disabled; pending writes will not complete until it is enabled"
            );
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.lock_state()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Propagates a new online state to every view and the listener.
    pub fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            let mut snapshots = Vec::new();
            for query_view in state.query_views_by_query.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    view_change.limbo_changes.is_empty(),
                    "Online state change produced limbo changes",
                );
                if let Some(snapshot) = view_change.snapshot {
                    snapshots.push(snapshot);
                }
            }
            snapshots
        };

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.lock_state().online_state
    }

    pub fn current_user(&self) -> User {
        self.lock_state().current_user.clone()
    }

    /// Limbo documents with an active resolution target.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock_state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a resolution slot.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.lock_state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    // Views

    /// Runs `changes` through every view, raises the resulting snapshots and
    /// pins what the views now show in the local store.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let (snapshots, view_changes, requests) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let mut snapshots = Vec::new();
            let mut view_changes = Vec::new();
            let mut requests = Vec::new();

            let mut applied: Vec<(TargetId, ViewChange)> = Vec::new();
            for query_view in state.query_views_by_query.values_mut() {
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
                if doc_changes.needs_refill {
                    // A limit query lost a document; re-run it to find the
                    // next one.
                    let result = self.local_store.execute_query(&query_view.query, false)?;
                    doc_changes = query_view
                        .view
                        .compute_doc_changes(&result.documents, Some(doc_changes));
                }
                let target_id = query_view.target_id;
                let target_change =
                    remote_event.and_then(|event| event.target_changes.get(&target_id));
                let target_is_pending_reset = remote_event
                    .map(|event| event.target_mismatches.contains_key(&target_id))
                    .unwrap_or(false);
                let view_change = query_view.view.apply_changes(
                    doc_changes,
                    true,
                    target_change,
                    target_is_pending_reset,
                );
                applied.push((target_id, view_change));
            }

            for (target_id, view_change) in applied {
                self.update_tracked_limbos(state, target_id, view_change.limbo_changes, &mut requests);
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
            (snapshots, view_changes, requests)
        };

        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
        self.local_store.notify_local_view_changes(&view_changes)?;
        self.execute_remote_requests(requests).await
    }

    /// Drops every view of `target_id` and the limbo documents only those
    /// views referenced. Returns the remote calls to make and the queries to
    /// report `error` to.
    fn remove_and_cleanup_target(
        &self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> (Vec<RemoteRequest>, Vec<Query>) {
        let mut requests = Vec::new();
        let queries = {
            let mut state = self.lock_state();
            let queries = state
                .queries_by_target
                .remove(&target_id)
                .unwrap_or_default();
            for query in &queries {
                state.query_views_by_query.remove(&query.canonical_id());
            }

            for key in state.limbo_document_refs.remove_references_for_id(target_id) {
                if !state.limbo_document_refs.contains_key(&key) {
                    self.remove_limbo_target(&mut state, &key, &mut requests);
                }
            }
            queries
        };

        if let Some(error) = error {
            if let Some(listener) = self.listener() {
                for query in &queries {
                    listener.on_watch_error(query, error.clone());
                }
            }
        }
        (requests, queries)
    }

    // Limbo resolution

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        requests: &mut Vec<RemoteRequest>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key, requests);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("sync engine: document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key, requests);
                    }
                }
            }
        }
    }

    fn track_limbo_change(
        &self,
        state: &mut SyncEngineState,
        key: DocumentKey,
        requests: &mut Vec<RemoteRequest>,
    ) {
        if !state.active_limbo_targets_by_key.contains_key(&key)
            && !state.enqueued_limbo_resolutions.contains(&key)
        {
            log::debug!("sync engine: new document in limbo: {key}");
            state.enqueued_limbo_resolutions.push_back(key);
            self.pump_enqueued_limbo_resolutions(state, requests);
        }
    }

    /// Starts resolution targets for enqueued limbo documents while slots
    /// are free.
    fn pump_enqueued_limbo_resolutions(
        &self,
        state: &mut SyncEngineState,
        requests: &mut Vec<RemoteRequest>,
    ) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_id_generator.next_id();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            requests.push(RemoteRequest::Listen(TargetData::new(
                Query::for_document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(
        &self,
        state: &mut SyncEngineState,
        key: &DocumentKey,
        requests: &mut Vec<RemoteRequest>,
    ) {
        state.enqueued_limbo_resolutions.retain(|other| other != key);
        let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        state
            .active_limbo_resolutions_by_target
            .remove(&limbo_target_id);
        requests.push(RemoteRequest::Unlisten(limbo_target_id));
        self.pump_enqueued_limbo_resolutions(state, requests);
    }

    async fn execute_remote_requests(&self, requests: Vec<RemoteRequest>) -> FirestoreResult<()> {
        for request in requests {
            match request {
                RemoteRequest::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteRequest::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    // Write callbacks

    fn process_user_callback(&self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = {
            let mut state = self.lock_state();
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .get_mut(&user)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self
            .lock_state()
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default();
        for callback in callbacks {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let pending = std::mem::take(&mut self.lock_state().pending_writes_callbacks);
        for callback in pending.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    // Remote syncer callbacks

    async fn apply_remote_event_internal(&self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.lock_state();
            for (target_id, change) in &remote_event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id)
                else {
                    continue;
                };
                hard_assert(
                    change.added_documents.len()
                        + change.modified_documents.len()
                        + change.removed_documents.len()
                        <= 1,
                    "Limbo resolution for single document contains multiple changes",
                );
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received change for limbo target document without add",
                    );
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received remove for limbo target document without add",
                    );
                    resolution.received_document = false;
                }
            }
        }

        let changes = self.local_store.apply_remote_event(&remote_event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&remote_event))
            .await
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut requests = Vec::new();
        let limbo_key = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    state.enqueued_limbo_resolutions.retain(|key| key != &resolution.key);
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    self.pump_enqueued_limbo_resolutions(state, &mut requests);
                    Some(resolution.key)
                }
                None => None,
            }
        };

        if let Some(key) = limbo_key {
            // The backend would not serve the limbo document; treat it as
            // deleted.
            log::debug!("sync engine: limbo resolution for {key} rejected: {error}");
            let mut document_updates = BTreeMap::new();
            document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                document_updates,
                resolved_limbo_documents: BTreeSet::from([key]),
                ..RemoteEvent::default()
            };
            self.apply_remote_event_internal(event).await?;
            return self.execute_remote_requests(requests).await;
        }

        self.local_store.release_target(target_id, false)?;
        let (cleanup_requests, _) = self.remove_and_cleanup_target(target_id, Some(error));
        requests.extend(cleanup_requests);
        self.execute_remote_requests(requests).await
    }

    async fn apply_successful_write_internal(&self, batch_result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = batch_result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(batch_result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    async fn reject_failed_write_internal(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    async fn handle_credential_change_internal(&self, user: User) -> FirestoreResult<()> {
        if self.lock_state().current_user == user {
            return Ok(());
        }
        log::debug!("sync engine: user changed to {}", user.to_key());
        let result = self.local_store.handle_user_change(user.clone())?;
        self.lock_state().current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "Pending writes were rejected because the user changed",
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.lock_state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views_by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(
        &self,
        batch_result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(batch_result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.remote_keys_for_target(target_id)
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_internal(user))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::core::{FirestoreSettings, IndexAutoCreation};
    use crate::firestore::local::{MemoryPersistence, QueryEngine};
    use crate::firestore::model::{DatabaseId, FieldPath, MutationResult};
    use crate::firestore::remote::{
        EmptyCredentialsProvider, InMemoryTransport, JsonProtoSerializer,
        MultiplexedStreamingConnection, NoopConnectivityMonitor,
    };
    use crate::firestore::value::{BytesValue, FirestoreValue, MapValue};
    use crate::util::async_queue::AsyncQueue;

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreError)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for Recorder {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        recorder: Arc<Recorder>,
        _listener: Arc<dyn SyncEngineListener>,
    }

    impl Harness {
        fn last_snapshot(&self) -> ViewSnapshot {
            self.recorder.snapshots.lock().unwrap().last().cloned().unwrap()
        }
    }

    /// Sync engine over a remote store whose network is disabled, so
    /// backend traffic is driven by calling the syncer directly.
    async fn harness(max_concurrent_limbo_resolutions: usize) -> Harness {
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::started()),
            QueryEngine::new(IndexAutoCreation::disabled()),
            User::unauthenticated(),
        ));
        let (client_transport, _server_transport) = InMemoryTransport::pair();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            JsonProtoSerializer::new(DatabaseId::for_project("demo")),
            Arc::new(MultiplexedStreamingConnection::new(client_transport)),
            Arc::new(EmptyCredentialsProvider),
            Arc::new(NoopConnectivityMonitor),
            AsyncQueue::new(),
            &FirestoreSettings::default(),
            Arc::new(|_: OnlineState| {}),
        );
        let engine = SyncEngine::new(
            local_store,
            remote_store.clone(),
            User::unauthenticated(),
            max_concurrent_limbo_resolutions,
        );
        let syncer: Arc<dyn RemoteSyncer> = engine.clone();
        remote_store.set_syncer(Arc::downgrade(&syncer));
        remote_store.disable_network().await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn SyncEngineListener> = recorder.clone();
        engine.set_listener(Arc::downgrade(&listener));
        Harness {
            engine,
            recorder,
            _listener: listener,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(field: &str, value: &str) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_single(field), FirestoreValue::from_string(value));
        data
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        let mut doc = MutableDocument::new_found_document(
            key(path),
            SnapshotVersion::from_micros(version),
            map("name", path),
        );
        doc.set_read_time(SnapshotVersion::from_micros(version));
        doc
    }

    fn current_event(target_id: TargetId, version: i64, docs: Vec<MutableDocument>) -> RemoteEvent {
        let change = TargetChange {
            resume_token: BytesValue::new(vec![version as u8]),
            current: true,
            added_documents: docs.iter().map(|doc| doc.key().clone()).collect(),
            ..TargetChange::default()
        };
        RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            target_changes: BTreeMap::from([(target_id, change)]),
            document_updates: docs.into_iter().map(|doc| (doc.key().clone(), doc)).collect(),
            ..RemoteEvent::default()
        }
    }

    /// Removes `keys` from the target's result set without telling the
    /// client what happened to the documents.
    fn removal_event(target_id: TargetId, version: i64, keys: &[&str]) -> RemoteEvent {
        let change = TargetChange {
            resume_token: BytesValue::new(vec![version as u8]),
            current: true,
            removed_documents: keys.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        };
        RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            target_changes: BTreeMap::from([(target_id, change)]),
            ..RemoteEvent::default()
        }
    }

    #[tokio::test]
    async fn listen_serves_cache_then_remote_event_syncs_view() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        let initial = h.engine.listen(&query, true).await.unwrap();
        assert!(initial.documents.is_empty());
        assert!(initial.from_cache);

        h.engine
            .apply_remote_event(current_event(2, 10, vec![doc("rooms/a", 10)]))
            .await
            .unwrap();
        let snapshot = h.last_snapshot();
        assert_eq!(snapshot.keys(), vec![key("rooms/a")]);
        assert!(!snapshot.from_cache);
        assert_eq!(
            h.engine.get_remote_keys_for_target(2),
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[tokio::test]
    async fn second_query_on_same_target_reuses_view() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine
            .apply_remote_event(current_event(2, 10, vec![doc("rooms/a", 10)]))
            .await
            .unwrap();

        let again = h.engine.listen(&query, true).await.unwrap();
        assert_eq!(again.keys(), vec![key("rooms/a")]);
        assert!(!again.from_cache);
    }

    #[tokio::test]
    async fn local_write_raises_snapshot_and_ack_resolves_callback() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();

        let (sender, mut receiver) = oneshot::channel();
        h.engine
            .write(vec![Mutation::set(key("rooms/a"), map("name", "x"))], sender)
            .await
            .unwrap();
        let snapshot = h.last_snapshot();
        assert_eq!(snapshot.keys(), vec![key("rooms/a")]);
        assert!(snapshot.has_pending_writes());
        assert!(receiver.try_recv().unwrap().is_none());

        let (pending_sender, mut pending_receiver) = oneshot::channel();
        h.engine
            .register_pending_writes_callback(pending_sender)
            .await
            .unwrap();
        assert!(pending_receiver.try_recv().unwrap().is_none());

        let batch = h
            .engine
            .local_store()
            .next_mutation_batch(None)
            .unwrap()
            .unwrap();
        let version = SnapshotVersion::from_micros(5);
        h.engine
            .apply_successful_write(MutationBatchResult::new(
                batch,
                version,
                vec![MutationResult::new(version, Vec::new())],
                BytesValue::default(),
            ))
            .await
            .unwrap();

        assert_eq!(receiver.try_recv().unwrap(), Some(Ok(())));
        assert_eq!(pending_receiver.try_recv().unwrap(), Some(Ok(())));
        // Committed but not yet seen by watch.
        assert!(h.last_snapshot().has_pending_writes());

        h.engine
            .apply_remote_event(current_event(2, 5, vec![doc("rooms/a", 5)]))
            .await
            .unwrap();
        let snapshot = h.last_snapshot();
        assert_eq!(snapshot.keys(), vec![key("rooms/a")]);
        assert!(!snapshot.has_pending_writes());
    }

    #[tokio::test]
    async fn rejected_write_reverts_the_view() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, false).await.unwrap();

        let (sender, mut receiver) = oneshot::channel();
        h.engine
            .write(vec![Mutation::set(key("rooms/a"), map("name", "x"))], sender)
            .await
            .unwrap();
        let batch_id = h
            .engine
            .local_store()
            .next_mutation_batch(None)
            .unwrap()
            .unwrap()
            .batch_id;
        h.engine
            .reject_failed_write(batch_id, crate::firestore::error::permission_denied("nope"))
            .await
            .unwrap();

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result.unwrap_err().code_str(), "firestore/permission-denied");
        assert!(h.last_snapshot().documents.is_empty());
    }

    #[tokio::test]
    async fn pending_writes_callback_resolves_immediately_without_writes() {
        let h = harness(100).await;
        let (sender, mut receiver) = oneshot::channel();
        h.engine.register_pending_writes_callback(sender).await.unwrap();
        assert_eq!(receiver.try_recv().unwrap(), Some(Ok(())));
    }

    #[tokio::test]
    async fn document_removed_from_target_goes_into_limbo_and_resolves() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine
            .apply_remote_event(current_event(2, 10, vec![doc("rooms/a", 10)]))
            .await
            .unwrap();

        h.engine
            .apply_remote_event(removal_event(2, 11, &["rooms/a"]))
            .await
            .unwrap();
        let active = h.engine.active_limbo_document_resolutions();
        assert_eq!(active.len(), 1);
        let limbo_target = active[&key("rooms/a")];
        assert_eq!(limbo_target % 2, 1);
        assert!(h.last_snapshot().from_cache);

        // The limbo target turns current without the document: deleted.
        let mut resolution = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(12),
            ..RemoteEvent::default()
        };
        resolution.target_changes.insert(
            limbo_target,
            TargetChange::synthesized_for_current_change(true, BytesValue::new(vec![12])),
        );
        let mut deleted =
            MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(12));
        deleted.set_read_time(SnapshotVersion::from_micros(12));
        resolution.document_updates.insert(key("rooms/a"), deleted);
        resolution.resolved_limbo_documents.insert(key("rooms/a"));
        h.engine.apply_remote_event(resolution).await.unwrap();

        assert!(h.engine.active_limbo_document_resolutions().is_empty());
        let snapshot = h.last_snapshot();
        assert!(snapshot.documents.is_empty());
        assert!(!snapshot.from_cache);
    }

    #[tokio::test]
    async fn limbo_resolutions_are_bounded_and_queued() {
        let h = harness(1).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine
            .apply_remote_event(current_event(
                2,
                10,
                vec![doc("rooms/a", 10), doc("rooms/b", 10)],
            ))
            .await
            .unwrap();
        h.engine
            .apply_remote_event(removal_event(2, 11, &["rooms/a", "rooms/b"]))
            .await
            .unwrap();

        assert_eq!(h.engine.active_limbo_document_resolutions().len(), 1);
        assert_eq!(h.engine.enqueued_limbo_document_resolutions().len(), 1);

        // A rejected limbo listen deletes the document and frees the slot.
        let (first, target) = h
            .engine
            .active_limbo_document_resolutions()
            .into_iter()
            .next()
            .unwrap();
        h.engine
            .reject_listen(target, crate::firestore::error::permission_denied("denied"))
            .await
            .unwrap();
        let active = h.engine.active_limbo_document_resolutions();
        assert_eq!(active.len(), 1);
        assert!(!active.contains_key(&first));
        assert!(h.engine.enqueued_limbo_document_resolutions().is_empty());
        assert!(!h.last_snapshot().documents.contains(&first));
    }

    #[tokio::test]
    async fn rejected_listen_removes_view_and_reports_error() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine
            .reject_listen(2, crate::firestore::error::permission_denied("denied"))
            .await
            .unwrap();

        let errors = h.recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, query.canonical_id());
        assert!(h.engine.get_remote_keys_for_target(2).is_empty());
    }

    #[tokio::test]
    async fn offline_state_marks_views_from_cache() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine
            .apply_remote_event(current_event(2, 10, vec![doc("rooms/a", 10)]))
            .await
            .unwrap();
        assert!(!h.last_snapshot().from_cache);

        h.engine.apply_online_state_change(OnlineState::Offline);
        assert!(h.last_snapshot().from_cache);
        assert_eq!(
            h.recorder.online_states.lock().unwrap().last(),
            Some(&OnlineState::Offline)
        );
    }

    #[tokio::test]
    async fn user_change_swaps_pending_writes() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, false).await.unwrap();
        let (sender, _receiver) = oneshot::channel();
        h.engine
            .write(vec![Mutation::set(key("rooms/a"), map("name", "x"))], sender)
            .await
            .unwrap();
        let (pending_sender, mut pending_receiver) = oneshot::channel();
        h.engine
            .register_pending_writes_callback(pending_sender)
            .await
            .unwrap();

        h.engine
            .handle_credential_change(User::new("bob"))
            .await
            .unwrap();
        assert_eq!(h.engine.current_user(), User::new("bob"));
        assert!(h.last_snapshot().documents.is_empty());
        let rejected = pending_receiver.try_recv().unwrap().unwrap();
        assert_eq!(rejected.unwrap_err().code_str(), "firestore/cancelled");
    }

    #[tokio::test]
    async fn unlisten_releases_target() {
        let h = harness(100).await;
        let query = Query::collection("rooms").unwrap();
        h.engine.listen(&query, true).await.unwrap();
        h.engine.unlisten(&query, true).await.unwrap();
        assert!(h.engine.local_store().active_target_ids().is_empty());
        assert!(h.engine.listen_to_remote_store(&query).await.is_err());
    }
}
