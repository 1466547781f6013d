use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::view_snapshot::sort_changes;
use crate::firestore::core::{
    ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, LimitType, OnlineState, Query,
    ViewSnapshot,
};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    /// Results come from the cache or still depend on limbo documents.
    Local,
    /// The backend confirmed the result set and no limbo documents remain.
    Synced,
}

/// A key entering or leaving limbo for one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Intermediate result of [`View::compute_doc_changes`], not yet applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// The limit window lost a document whose replacement may only be
    /// found by re-running the query against the cache.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Live result set of one query, updated incrementally from local and remote
/// document changes.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    has_cached_results: bool,
}

impl View {
    /// `synced_documents` are the keys the backend last reported for the
    /// query's target.
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            synced_documents,
            has_cached_results: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Works out how `changes` alter the view without applying them.
    /// Passing the result of an earlier call continues from its state; the
    /// sync engine does this after re-reading the cache for a refill.
    pub fn compute_doc_changes(
        &self,
        changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, mut document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let comparator = self.query.comparator();
        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => document_set.first().cloned(),
            _ => None,
        };
        let mut needs_refill = false;

        for (key, entry) in changes {
            let old_doc = document_set.get(key).cloned();
            let new_doc = if self.query.matches(entry) {
                Some(entry)
            } else {
                None
            };
            let old_had_pending = old_doc
                .as_ref()
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_has_pending = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key())
                            && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (&old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new.clone(),
                            ));
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .map(|last| comparator.compare(new, last).is_gt())
                                .unwrap_or(false);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .map(|first| comparator.compare(new, first).is_lt())
                                .unwrap_or(false);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        document_set.add(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes plus the target change from the backend, if
    /// any. Returns a snapshot only when documents or the sync state changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents =
            std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        sort_changes(&mut changes, &self.query);
        self.apply_target_change(target_change);

        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let has_cached_results = target_change
            .map(|change| !change.resume_token.is_empty())
            .unwrap_or(false);
        self.has_cached_results |= has_cached_results;
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: doc_changes.document_set,
                old_documents,
                document_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops the view out of the synced state so listeners
    /// learn their results may be stale.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
            self.has_cached_results,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let previous = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = previous
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&previous)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A locally modified document whose acknowledged version arrived before the
/// matching watch update; keep showing the local version until it does.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Direction;
    use crate::firestore::model::{MutableDocument, SnapshotVersion};
    use crate::firestore::value::{BytesValue, FirestoreValue, MapValue};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(BTreeMap::from([(
                "rank".to_string(),
                FirestoreValue::from_integer(rank),
            )])),
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_map(docs: Vec<MutableDocument>) -> BTreeMap<DocumentKey, Document> {
        docs.into_iter().map(|d| (d.key().clone(), d)).collect()
    }

    fn apply(view: &mut View, docs: Vec<MutableDocument>) -> Option<ViewSnapshot> {
        let changes = view.compute_doc_changes(&doc_map(docs), None);
        view.apply_changes(changes, true, None, false).snapshot
    }

    fn ack_target(keys: &[&str], current: bool) -> TargetChange {
        TargetChange {
            resume_token: BytesValue::from(vec![1u8]),
            current,
            added_documents: keys.iter().map(|k| key(k)).collect(),
            modified_documents: BTreeSet::new(),
            removed_documents: BTreeSet::new(),
        }
    }

    fn ranked_query(limit: u32) -> Query {
        Query::collection("items")
            .unwrap()
            .order_by("rank", Direction::Ascending)
            .unwrap()
            .limit_to_first(limit)
    }

    #[test]
    fn initial_documents_are_added_in_order() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        let snapshot = apply(&mut view, vec![doc("items/b", 1), doc("items/a", 2)])
            .expect("snapshot");
        assert_eq!(snapshot.keys(), vec![key("items/a"), key("items/b")]);
        assert!(snapshot.from_cache);
        assert!(snapshot
            .document_changes
            .iter()
            .all(|c| c.change_type == ChangeType::Added));
    }

    #[test]
    fn limit_re_truncates_when_a_document_sorts_ahead() {
        let mut view = View::new(ranked_query(2), BTreeSet::new());
        apply(&mut view, vec![doc("items/a", 1), doc("items/b", 2)]);

        let snapshot = apply(&mut view, vec![doc("items/c", 0)]).expect("snapshot");
        assert_eq!(snapshot.keys(), vec![key("items/c"), key("items/a")]);
        let changes: Vec<(ChangeType, String)> = snapshot
            .document_changes
            .iter()
            .map(|c| (c.change_type, c.document.key().to_string()))
            .collect();
        assert_eq!(
            changes,
            vec![
                (ChangeType::Removed, "items/b".to_string()),
                (ChangeType::Added, "items/c".to_string())
            ]
        );
    }

    #[test]
    fn removal_from_full_limit_needs_refill() {
        let view_query = ranked_query(2);
        let mut view = View::new(view_query, BTreeSet::new());
        apply(&mut view, vec![doc("items/a", 1), doc("items/b", 2)]);

        let deleted = MutableDocument::new_no_document(key("items/a"), SnapshotVersion::from_micros(2));
        let changes = view.compute_doc_changes(&doc_map(vec![deleted]), None);
        assert!(changes.needs_refill);

        let moved = view.compute_doc_changes(&doc_map(vec![doc("items/a", 5)]), None);
        assert!(moved.needs_refill);
    }

    #[test]
    fn recomputing_is_deterministic() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        apply(&mut view, vec![doc("items/a", 1), doc("items/b", 2)]);
        let incoming = doc_map(vec![doc("items/a", 9), doc("items/c", 0)]);
        let first = view.compute_doc_changes(&incoming, None).change_set.changes();
        let second = view.compute_doc_changes(&incoming, None).change_set.changes();
        assert_eq!(first, second);
    }

    #[test]
    fn current_target_without_limbo_is_synced() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        let changes = view.compute_doc_changes(&doc_map(vec![doc("items/a", 1)]), None);
        let change = view.apply_changes(changes, true, Some(&ack_target(&["items/a"], true)), false);
        let snapshot = change.snapshot.expect("snapshot");
        assert!(!snapshot.from_cache);
        assert!(snapshot.has_cached_results);
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        let changes =
            view.compute_doc_changes(&doc_map(vec![doc("items/a", 1), doc("items/b", 1)]), None);
        let change = view.apply_changes(changes, true, Some(&ack_target(&["items/a"], true)), false);
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(key("items/b"))]
        );
        assert!(change.snapshot.expect("snapshot").from_cache);

        let removal = TargetChange {
            resume_token: BytesValue::default(),
            current: true,
            added_documents: BTreeSet::from([key("items/b")]),
            modified_documents: BTreeSet::new(),
            removed_documents: BTreeSet::new(),
        };
        let changes = view.compute_doc_changes(&BTreeMap::new(), None);
        let change = view.apply_changes(changes, true, Some(&removal), false);
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Removed(key("items/b"))]
        );
        assert!(!change.snapshot.expect("snapshot").from_cache);
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        let mut local = doc("items/a", 1);
        local.set_has_local_mutations();
        apply(&mut view, vec![local]);

        let snapshot = apply(&mut view, vec![doc("items/a", 1)]).expect("snapshot");
        assert_eq!(snapshot.document_changes.len(), 1);
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn going_offline_marks_results_from_cache() {
        let mut view = View::new(Query::collection("items").unwrap(), BTreeSet::new());
        let changes = view.compute_doc_changes(&doc_map(vec![doc("items/a", 1)]), None);
        view.apply_changes(changes, true, Some(&ack_target(&["items/a"], true)), false);

        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.expect("snapshot");
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.document_changes.is_empty());
        assert!(view
            .apply_online_state_change(OnlineState::Offline)
            .snapshot
            .is_none());
    }
}
