mod bundle_cache;
mod document_overlay_cache;
mod index_manager;
mod local_documents_view;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod memory_persistence;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_delegate;
mod reference_set;
mod remote_document_cache;
mod target_cache;
mod target_data;

pub use bundle_cache::{BundleCache, BundleMetadata, MemoryBundleCache, NamedQuery};
pub use document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache};
pub use index_manager::{IndexManager, IndexType, MemoryIndexManager};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{DocumentMap, LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{LruGarbageCollector, LruResults, INVALID_SEQUENCE_NUMBER};
pub use memory_persistence::MemoryPersistence;
pub use mutation_queue::{MemoryMutationQueue, MutationQueue, BATCH_ID_UNKNOWN};
pub use persistence::{
    Persistence, PersistenceTransaction, TransactionMode, TransactionOperation,
};
pub use query_engine::{QueryContext, QueryEngine};
pub use reference_delegate::{MemoryLruDelegate, ReferenceDelegate};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
pub use target_cache::{MemoryTargetCache, TargetCache};
pub use target_data::{TargetData, TargetPurpose};
