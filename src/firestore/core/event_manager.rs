use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::{
    ChangeType, OnlineState, Query, SyncEngine, SyncEngineListener, ViewSnapshot,
};
use crate::firestore::error::{FirestoreError, FirestoreResult};

/// Receives the snapshots (or the terminal error) of one listener.
pub type ViewSnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

/// Callback raised once every listener has seen a consistent snapshot.
pub type SnapshotsInSyncObserver = Arc<dyn Fn() + Send + Sync>;

/// Where a listener gets its data from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Cache first, then the backend.
    #[default]
    Default,
    /// Only the local cache; the backend is never contacted for this
    /// listener.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots when only metadata (pending writes, cache state)
    /// changed.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the backend answered, unless the
    /// client is offline.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct ListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Filters the view snapshots of a query down to the events one listener
/// asked for.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: ViewSnapshotObserver,
    state: Mutex<ListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: ViewSnapshotObserver) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst),
            query,
            options,
            observer,
            state: Mutex::new(ListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn options(&self) -> ListenOptions {
        self.options
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns true if an event was raised to the observer.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let mut snapshot = snapshot;
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let event = {
            let mut state = lock(&self.state);
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(state.snapshot.as_ref(), &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };

        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// A deferred first snapshot may become raisable when the client goes
    /// offline. Returns true if an event was raised.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, previous: Option<&ViewSnapshot>, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = previous
            .map(|previous| previous.has_pending_writes() != snapshot.has_pending_writes())
            .unwrap_or(false);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.documents.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    )
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

impl QueryListenersInfo {
    fn new() -> Self {
        Self {
            view_snapshot: None,
            listeners: Vec::new(),
        }
    }

    fn has_remote_listeners(&self) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.listens_to_remote_store())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerSetupAction {
    InitializeLocalListenAndRequireWatchConnection,
    InitializeLocalListenOnly,
    RequireWatchConnectionOnly,
    NoActionRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerRemovalAction {
    TerminateLocalListenAndRequireWatchDisconnection,
    TerminateLocalListenOnly,
    RequireWatchDisconnectionOnly,
    NoActionRequired,
}

struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    next_sync_listener_id: u64,
    snapshots_in_sync_listeners: BTreeMap<u64, SnapshotsInSyncObserver>,
}

/// Fans the view snapshots of the sync engine out to query listeners and
/// deduplicates identical queries onto one sync engine listen.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: Arc::clone(&sync_engine),
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                next_sync_listener_id: 1,
                snapshots_in_sync_listeners: BTreeMap::new(),
            }),
        });
        let listener: Arc<dyn SyncEngineListener> = manager.clone();
        sync_engine.set_listener(Arc::downgrade(&listener));
        manager
    }

    /// Registers `listener`. Failures to set up the query are delivered to
    /// the listener itself.
    pub async fn listen(&self, listener: Arc<QueryListener>) {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();
        let action = {
            let mut state = lock(&self.state);
            let first_listen = !state.queries.contains_key(&canonical_id);
            let info = state
                .queries
                .entry(canonical_id.clone())
                .or_insert_with(QueryListenersInfo::new);
            if first_listen {
                if listener.listens_to_remote_store() {
                    ListenerSetupAction::InitializeLocalListenAndRequireWatchConnection
                } else {
                    ListenerSetupAction::InitializeLocalListenOnly
                }
            } else if !info.has_remote_listeners() && listener.listens_to_remote_store() {
                ListenerSetupAction::RequireWatchConnectionOnly
            } else {
                ListenerSetupAction::NoActionRequired
            }
        };

        let setup = match action {
            ListenerSetupAction::InitializeLocalListenAndRequireWatchConnection => {
                self.sync_engine.listen(&query, true).await.map(Some)
            }
            ListenerSetupAction::InitializeLocalListenOnly => {
                self.sync_engine.listen(&query, false).await.map(Some)
            }
            ListenerSetupAction::RequireWatchConnectionOnly => self
                .sync_engine
                .listen_to_remote_store(&query)
                .await
                .map(|_| None),
            ListenerSetupAction::NoActionRequired => Ok(None),
        };

        let (online_state, view_snapshot) = {
            let mut state = lock(&self.state);
            match setup {
                Err(err) => {
                    if let Some(info) = state.queries.get(&canonical_id) {
                        if info.listeners.is_empty() {
                            state.queries.remove(&canonical_id);
                        }
                    }
                    drop(state);
                    log::warn!("initialization of query '{canonical_id}' failed: {err}");
                    listener.on_error(err);
                    return;
                }
                Ok(initial) => {
                    let online_state = state.online_state;
                    let info = state
                        .queries
                        .entry(canonical_id.clone())
                        .or_insert_with(QueryListenersInfo::new);
                    if let Some(initial) = initial {
                        info.view_snapshot = Some(initial);
                    }
                    info.listeners.push(Arc::clone(&listener));
                    (online_state, info.view_snapshot.clone())
                }
            }
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            if listener.on_view_snapshot(snapshot) {
                self.raise_snapshots_in_sync_event();
            }
        }
    }

    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();
        let action = {
            let mut state = lock(&self.state);
            let mut action = ListenerRemovalAction::NoActionRequired;
            if let Some(info) = state.queries.get_mut(&canonical_id) {
                if let Some(index) = info
                    .listeners
                    .iter()
                    .position(|existing| existing.id() == listener.id())
                {
                    info.listeners.remove(index);
                    action = if info.listeners.is_empty() {
                        if listener.listens_to_remote_store() {
                            ListenerRemovalAction::TerminateLocalListenAndRequireWatchDisconnection
                        } else {
                            ListenerRemovalAction::TerminateLocalListenOnly
                        }
                    } else if !info.has_remote_listeners() && listener.listens_to_remote_store() {
                        ListenerRemovalAction::RequireWatchDisconnectionOnly
                    } else {
                        ListenerRemovalAction::NoActionRequired
                    };
                }
            }
            if matches!(
                action,
                ListenerRemovalAction::TerminateLocalListenAndRequireWatchDisconnection
                    | ListenerRemovalAction::TerminateLocalListenOnly
            ) {
                state.queries.remove(&canonical_id);
            }
            action
        };

        match action {
            ListenerRemovalAction::TerminateLocalListenAndRequireWatchDisconnection => {
                self.sync_engine.unlisten(&query, true).await
            }
            ListenerRemovalAction::TerminateLocalListenOnly => {
                self.sync_engine.unlisten(&query, false).await
            }
            ListenerRemovalAction::RequireWatchDisconnectionOnly => {
                self.sync_engine.unlisten_from_remote_store(&query).await
            }
            ListenerRemovalAction::NoActionRequired => Ok(()),
        }
    }

    pub fn add_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) -> u64 {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_sync_listener_id;
            state.next_sync_listener_id += 1;
            state.snapshots_in_sync_listeners.insert(id, Arc::clone(&observer));
            id
        };
        observer();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        lock(&self.state).snapshots_in_sync_listeners.remove(&id);
    }

    pub fn online_state(&self) -> OnlineState {
        lock(&self.state).online_state
    }

    fn raise_snapshots_in_sync_event(&self) {
        let observers: Vec<SnapshotsInSyncObserver> = lock(&self.state)
            .snapshots_in_sync_listeners
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer();
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries: Vec<(Vec<Arc<QueryListener>>, ViewSnapshot)> = {
            let mut state = lock(&self.state);
            snapshots
                .into_iter()
                .filter_map(|snapshot| {
                    let info = state.queries.get_mut(&snapshot.query.canonical_id())?;
                    info.view_snapshot = Some(snapshot.clone());
                    Some((info.listeners.clone(), snapshot))
                })
                .collect()
        };

        let mut raised_event = false;
        for (listeners, snapshot) in deliveries {
            for listener in listeners {
                raised_event |= listener.on_view_snapshot(snapshot.clone());
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = lock(&self.state).queries.remove(&query.canonical_id());
        if let Some(info) = removed {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        let mut raised_event = false;
        for listener in listeners {
            raised_event |= listener.apply_online_state_change(online_state);
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{DocumentSet, DocumentViewChange};
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;

    type Events = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn recording_listener(options: ListenOptions) -> (Arc<QueryListener>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener = QueryListener::new(
            Query::collection("rooms").unwrap(),
            options,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        );
        (listener, events)
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        )
    }

    fn snapshot(paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let query = Query::collection("rooms").unwrap();
        let mut documents = DocumentSet::new(query.comparator());
        for path in paths {
            documents.add(doc(path));
        }
        ViewSnapshot::from_initial_documents(query, documents, BTreeSet::new(), from_cache, false)
    }

    #[test]
    fn waits_for_sync_while_maybe_online() {
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let (listener, events) = recording_listener(options);
        assert!(!listener.on_view_snapshot(snapshot(&["rooms/a"], true)));
        assert!(events.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let first = events[0].as_ref().unwrap();
        assert!(first.from_cache);
        assert_eq!(first.document_changes.len(), 1);
    }

    #[test]
    fn empty_cache_snapshot_is_held_back_until_server_answers() {
        let (listener, events) = recording_listener(ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot(&[], true)));
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], false)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn cache_only_listener_raises_immediately() {
        let options = ListenOptions {
            source: ListenSource::Cache,
            ..ListenOptions::default()
        };
        let (listener, events) = recording_listener(options);
        assert!(listener.on_view_snapshot(snapshot(&[], true)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (plain, plain_events) = recording_listener(ListenOptions::default());
        let (verbose, verbose_events) = recording_listener(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        for listener in [&plain, &verbose] {
            assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], false)));
        }

        let mut metadata_only = snapshot(&["rooms/a"], false);
        metadata_only.sync_state_changed = false;
        metadata_only.document_changes =
            vec![DocumentViewChange::new(ChangeType::Metadata, doc("rooms/a"))];
        metadata_only.mutated_keys.insert(DocumentKey::from_string("rooms/a").unwrap());

        assert!(!plain.on_view_snapshot(metadata_only.clone()));
        assert!(verbose.on_view_snapshot(metadata_only));
        assert_eq!(plain_events.lock().unwrap().len(), 1);
        assert_eq!(verbose_events.lock().unwrap().len(), 2);
    }

    #[test]
    fn errors_reach_the_observer() {
        let (listener, events) = recording_listener(ListenOptions::default());
        listener.on_error(crate::firestore::error::permission_denied("denied"));
        assert!(events.lock().unwrap()[0].is_err());
    }
}
