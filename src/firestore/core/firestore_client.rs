use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use once_cell::sync::OnceCell;

use crate::firestore::api::{
    parse_set_data, parse_update_data, DocumentSnapshot, QuerySnapshot, SetOptions,
};
use crate::firestore::core::{
    EventManager, FirestoreSettings, ListenOptions, OnlineState, Query, QueryListener,
    SyncEngine, View, ViewSnapshot, ViewSnapshotObserver,
};
use crate::firestore::error::{cancelled, failed_precondition, unavailable, FirestoreResult};
use crate::firestore::local::{
    LocalStore, LruGarbageCollector, MemoryPersistence, QueryEngine,
};
use crate::firestore::model::{DatabaseId, DocumentKey, Mutation};
use crate::firestore::remote::{
    ConnectionArc, ConnectivityMonitorArc, JsonProtoSerializer, OnlineStateHandler, RemoteStore,
    RemoteSyncer, TokenProviderArc, User,
};
use crate::firestore::value::FirestoreValue;
use crate::util::async_queue::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};

/// Entry point of the offline-first client. Owns the local store, the
/// remote store, the sync engine and the event manager, and runs every
/// operation on one [`AsyncQueue`].
pub struct FirestoreClient {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    credentials: TokenProviderArc,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    garbage_collector: LruGarbageCollector,
    gc_task: Mutex<Option<DelayedOperation>>,
}

impl FirestoreClient {
    /// Builds the client components and starts the network.
    pub async fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        connection: ConnectionArc,
        credentials: TokenProviderArc,
        connectivity_monitor: ConnectivityMonitorArc,
    ) -> FirestoreResult<Arc<Self>> {
        settings.validate()?;
        let queue = AsyncQueue::new();

        // The provider reports the current user right away; later changes
        // go to the client once it exists.
        let initial_user: Arc<Mutex<Option<User>>> = Arc::new(Mutex::new(None));
        let client_cell: Arc<OnceCell<Weak<FirestoreClient>>> = Arc::new(OnceCell::new());
        {
            let initial_user = Arc::clone(&initial_user);
            let client_cell = Arc::clone(&client_cell);
            credentials.set_change_listener(Arc::new(move |user: User| {
                match client_cell.get().and_then(Weak::upgrade) {
                    Some(client) => client.handle_user_change(user),
                    None => *lock(&initial_user) = Some(user),
                }
            }));
        }
        let user = lock(&initial_user).take().unwrap_or_default();
        log::debug!(
            "firestore client: initializing for {} as {}",
            database_id,
            user.to_key()
        );

        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            QueryEngine::new(settings.index_auto_creation.clone()),
            user.clone(),
        ));
        local_store.start()?;

        let engine_cell: Arc<OnceCell<Weak<SyncEngine>>> = Arc::new(OnceCell::new());
        let online_state_handler: OnlineStateHandler = {
            let engine_cell = Arc::clone(&engine_cell);
            Arc::new(move |online_state: OnlineState| {
                if let Some(engine) = engine_cell.get().and_then(Weak::upgrade) {
                    engine.apply_online_state_change(online_state);
                }
            })
        };
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            JsonProtoSerializer::new(database_id.clone()),
            connection,
            Arc::clone(&credentials),
            connectivity_monitor,
            queue.clone(),
            &settings,
            online_state_handler,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            user,
            settings.max_concurrent_limbo_resolutions,
        );
        let _ = engine_cell.set(Arc::downgrade(&sync_engine));
        let syncer: Arc<dyn RemoteSyncer> = sync_engine.clone();
        remote_store.set_syncer(Arc::downgrade(&syncer));
        let event_manager = EventManager::new(Arc::clone(&sync_engine));

        let client = Arc::new(Self {
            database_id,
            garbage_collector: LruGarbageCollector::new(settings.lru_params()),
            settings,
            queue,
            credentials,
            local_store,
            remote_store,
            sync_engine,
            event_manager,
            gc_task: Mutex::new(None),
        });
        let _ = client_cell.set(Arc::downgrade(&client));

        let remote_store = client.remote_store.clone();
        client
            .queue
            .enqueue(box_queue_future(async move { remote_store.start().await }))
            .await?;
        client.schedule_garbage_collection(client.settings.gc_initial_delay);
        Ok(client)
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn online_state(&self) -> OnlineState {
        self.event_manager.online_state()
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        Ok(())
    }

    fn handle_user_change(&self, user: User) {
        let remote_store = self.remote_store.clone();
        self.queue.enqueue_and_forget(box_queue_future(async move {
            log::debug!("firestore client: credential changed, user is {}", user.to_key());
            remote_store.handle_credential_change(user).await
        }));
    }

    // Listens

    /// Registers `observer` for snapshots of `query`. Events stop once the
    /// returned registration is removed.
    pub fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        self.verify_not_terminated()?;
        query.validate()?;
        let muted = Arc::new(AtomicBool::new(false));
        let view_observer: ViewSnapshotObserver = {
            let muted = Arc::clone(&muted);
            Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
                if muted.load(Ordering::SeqCst) {
                    return;
                }
                observer(result.map(|snapshot| QuerySnapshot::from_view_snapshot(&snapshot)));
            })
        };
        let listener = QueryListener::new(query, options, view_observer);

        let event_manager = Arc::clone(&self.event_manager);
        let registered = Arc::clone(&listener);
        self.queue.enqueue_and_forget(box_queue_future(async move {
            event_manager.listen(registered).await;
            Ok(())
        }));
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::clone(&self.event_manager),
            listener,
            muted,
        })
    }

    /// Like [`listen`](Self::listen) but delivers snapshots through a
    /// channel. Dropping the stream removes the listener.
    pub fn listen_stream(&self, query: Query, options: ListenOptions) -> FirestoreResult<QuerySnapshotStream> {
        let (sender, receiver) = async_channel::unbounded();
        let registration = self.listen(query, options, move |result| {
            let _ = sender.try_send(result);
        })?;
        Ok(QuerySnapshotStream {
            receiver,
            registration,
        })
    }

    /// Fires whenever every active listener has seen a consistent set of
    /// snapshots.
    pub fn add_snapshots_in_sync_listener<F>(&self, observer: F) -> FirestoreResult<SnapshotsInSyncRegistration>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.verify_not_terminated()?;
        let id = self.event_manager.add_snapshots_in_sync_listener(Arc::new(observer));
        Ok(SnapshotsInSyncRegistration {
            event_manager: Arc::clone(&self.event_manager),
            id,
        })
    }

    // Writes

    /// Applies `mutations` as one batch. Resolves once the backend
    /// acknowledged or rejected it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(box_queue_future(async move {
                sync_engine.write(mutations, sender).await
            }))
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The write was abandoned before it completed"))?
    }

    pub async fn set(
        &self,
        path: &str,
        data: BTreeMap<String, FirestoreValue>,
        options: SetOptions,
    ) -> FirestoreResult<()> {
        let mutation = parse_set_data(DocumentKey::from_string(path)?, data, &options)?;
        self.write(vec![mutation]).await
    }

    pub async fn update(&self, path: &str, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<()> {
        let mutation = parse_update_data(DocumentKey::from_string(path)?, data)?;
        self.write(vec![mutation]).await
    }

    pub async fn delete(&self, path: &str) -> FirestoreResult<()> {
        self.write(vec![Mutation::delete(DocumentKey::from_string(path)?)])
            .await
    }

    /// Resolves once every write issued so far was acknowledged or
    /// rejected. Fails with `cancelled` if the user changes meanwhile.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(box_queue_future(async move {
                sync_engine.register_pending_writes_callback(sender).await
            }))
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("Waiting for pending writes was abandoned"))?
    }

    // Cache reads

    pub async fn get_document_from_cache(&self, path: &str) -> FirestoreResult<DocumentSnapshot> {
        let key = DocumentKey::from_string(path)?;
        let local_store = Arc::clone(&self.local_store);
        let document = self
            .queue
            .enqueue(box_queue_future(async move { local_store.read_document(&key) }))
            .await?;
        if document.is_found_document() || document.is_no_document() {
            return Ok(DocumentSnapshot::from_document(&document, true));
        }
        Err(unavailable(
            "Failed to get document from cache. (However, this document may exist on the server. \
             Run again without reading from the cache to retrieve it from the server.)",
        ))
    }

    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<QuerySnapshot> {
        query.validate()?;
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(box_queue_future(async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys);
                let doc_changes = view.compute_doc_changes(&result.documents, None);
                let view_change = view.apply_changes(doc_changes, false, None, false);
                let snapshot = view_change.snapshot.unwrap_or_else(|| view.compute_initial_snapshot());
                Ok(QuerySnapshot::from_view_snapshot(&snapshot))
            }))
            .await
    }

    // Network

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(box_queue_future(async move { remote_store.enable_network().await }))
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(box_queue_future(async move { remote_store.disable_network().await }))
            .await
    }

    /// Shuts the client down. Pending timers are dropped and every later
    /// operation fails with `failed-precondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.credentials.remove_change_listener();
        let gc_task = lock(&self.gc_task).take();
        let remote_store = self.remote_store.clone();
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue_and_initiate_shutdown(box_queue_future(async move {
                if let Some(task) = gc_task {
                    task.cancel();
                }
                remote_store.shutdown().await;
                local_store.shutdown();
                log::debug!("firestore client: terminated");
                Ok(())
            }))
            .await
    }

    // Garbage collection

    fn schedule_garbage_collection(self: &Arc<Self>, delay: Duration) {
        if !self.garbage_collector.is_enabled() || self.is_terminated() {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = self.queue.enqueue_after_delay(
            TimerId::LruGarbageCollection,
            delay,
            box_queue_future(async move {
                let Some(client) = weak.upgrade() else {
                    return Ok(());
                };
                match client.local_store.collect_garbage(&client.garbage_collector) {
                    Ok(results) if results.did_run => log::debug!(
                        "firestore client: garbage collection removed {} targets and {} documents",
                        results.targets_removed,
                        results.documents_removed
                    ),
                    Ok(_) => {}
                    Err(err) => log::warn!("firestore client: garbage collection failed: {err}"),
                }
                client.schedule_garbage_collection(client.settings.gc_regular_delay);
                Ok(())
            }),
        );
        *lock(&self.gc_task) = Some(task);
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Arc<EventManager>,
    listener: Arc<QueryListener>,
    muted: Arc<AtomicBool>,
}

impl ListenerRegistration {
    /// Stops the listener. No events are delivered after this returns.
    pub fn remove(&self) {
        if self.muted.swap(true, Ordering::SeqCst) {
            return;
        }
        let event_manager = Arc::clone(&self.event_manager);
        let listener = Arc::clone(&self.listener);
        self.queue.enqueue_and_forget(box_queue_future(async move {
            event_manager.unlisten(&listener).await
        }));
    }
}

/// Snapshots of one query delivered through a channel.
pub struct QuerySnapshotStream {
    receiver: async_channel::Receiver<FirestoreResult<QuerySnapshot>>,
    registration: ListenerRegistration,
}

impl QuerySnapshotStream {
    /// Next snapshot or error; `None` once the listener is removed.
    pub async fn next(&self) -> Option<FirestoreResult<QuerySnapshot>> {
        self.receiver.recv().await.ok()
    }

    pub fn registration(&self) -> &ListenerRegistration {
        &self.registration
    }
}

impl Drop for QuerySnapshotStream {
    fn drop(&mut self) {
        self.registration.remove();
    }
}

pub struct SnapshotsInSyncRegistration {
    event_manager: Arc<EventManager>,
    id: u64,
}

impl SnapshotsInSyncRegistration {
    pub fn remove(&self) {
        self.event_manager.remove_snapshots_in_sync_listener(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
