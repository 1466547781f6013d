use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::{
    MemoryBundleCache, MemoryDocumentOverlayCache, MemoryIndexManager, MemoryLruDelegate,
    MemoryMutationQueue, MemoryRemoteDocumentCache, MemoryTargetCache, MutationQueue, Persistence,
    PersistenceTransaction, TransactionMode, TransactionOperation,
};
use crate::firestore::model::ListenSequenceNumber;
use crate::firestore::remote::User;
use crate::util::fail;

/// Volatile backend keeping every store in memory.
///
/// Write transactions run against a copy of the stores that replaces the
/// live state only when the transaction succeeds. The cache-sized stores
/// share their entries with the copy, so only the collections a transaction
/// writes to are duplicated.
pub struct MemoryPersistence {
    stores: Mutex<MemoryStores>,
    started: AtomicBool,
}

#[derive(Clone, Default)]
struct MemoryStores {
    mutation_queues: BTreeMap<User, MemoryMutationQueue>,
    document_overlays: BTreeMap<User, MemoryDocumentOverlayCache>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    bundle_cache: MemoryBundleCache,
    index_manager: MemoryIndexManager,
    reference_delegate: MemoryLruDelegate,
    listen_sequence: ListenSequenceNumber,
}

impl MemoryStores {
    fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.listen_sequence += 1;
        self.listen_sequence
    }

    fn transaction<'a>(
        &'a mut self,
        label: &'a str,
        user: &'a User,
        current_sequence_number: ListenSequenceNumber,
    ) -> PersistenceTransaction<'a> {
        let MemoryStores {
            mutation_queues,
            document_overlays,
            remote_documents,
            target_cache,
            bundle_cache,
            index_manager,
            reference_delegate,
            ..
        } = self;

        mutation_queues.entry(user.clone()).or_default();
        let overlays = document_overlays.entry(user.clone()).or_default();

        let mut current_queue: Option<&'a mut dyn MutationQueue> = None;
        let mut other_mutation_queues: Vec<&'a dyn MutationQueue> = Vec::new();
        for (queue_user, queue) in mutation_queues.iter_mut() {
            if queue_user == user {
                current_queue = Some(queue);
            } else {
                other_mutation_queues.push(queue);
            }
        }
        let Some(mutation_queue) = current_queue else {
            fail("mutation queue for the current user is missing");
        };

        PersistenceTransaction {
            label,
            user,
            current_sequence_number,
            mutation_queue,
            other_mutation_queues,
            document_overlays: overlays,
            remote_documents,
            target_cache,
            bundle_cache,
            index_manager,
            reference_delegate,
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(MemoryStores::default()),
            started: AtomicBool::new(false),
        }
    }

    /// Creates and starts a persistence instance.
    pub fn started() -> Self {
        let persistence = Self::new();
        persistence.started.store(true, Ordering::SeqCst);
        persistence
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStores> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for MemoryPersistence {
    fn start(&self) -> FirestoreResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn execute_transaction(
        &self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        operation: &mut TransactionOperation<'_>,
    ) -> FirestoreResult<()> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Cannot run transaction '{label}': persistence is not started"
            )));
        }
        log::trace!("persistence: starting transaction '{label}' ({mode:?})");

        let mut stores = self.lock();
        let sequence_number = stores.next_sequence_number();
        if mode.is_read_only() {
            let mut txn = stores.transaction(label, user, sequence_number);
            return operation(&mut txn);
        }

        let mut staged = stores.clone();
        {
            let mut txn = staged.transaction(label, user, sequence_number);
            operation(&mut txn)?;
        }
        *stores = staged;
        Ok(())
    }
}
