mod bound;
mod document_set;
mod event_manager;
mod filter;
mod firestore_client;
mod online_state;
mod order_by;
mod query;
mod settings;
mod sync_engine;
mod target;
mod view;
mod view_snapshot;

pub use bound::Bound;
pub use document_set::DocumentSet;
pub use event_manager::{
    EventManager, ListenOptions, ListenSource, QueryListener, ViewSnapshotObserver,
};
pub use filter::{FieldFilter, FilterOperator};
pub use firestore_client::{
    FirestoreClient, ListenerRegistration, QuerySnapshotStream, SnapshotsInSyncRegistration,
};
pub use online_state::{OnlineState, OnlineStateSource};
pub use order_by::{Direction, OrderBy};
pub use query::{DocumentComparator, LimitType, Query};
pub use settings::{
    FirestoreSettings, IndexAutoCreation, LruParams, RetrySettings, CACHE_SIZE_UNLIMITED,
    DEFAULT_CACHE_SIZE_BYTES,
};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCallback};
pub use target::{Target, TargetIdGenerator};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
