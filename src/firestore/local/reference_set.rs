use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, TargetId};

/// Bidirectional index between document keys and the ids (target ids or
/// batch ids) referencing them. Keeps two sorted sets so both directions are
/// range scans. Clones share both sets until one of them is written.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: Arc<BTreeSet<(DocumentKey, TargetId)>>,
    by_id: Arc<BTreeSet<(TargetId, DocumentKey)>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        Arc::make_mut(&mut self.by_id).insert((id, key.clone()));
        Arc::make_mut(&mut self.by_key).insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: TargetId) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        let entry = (key.clone(), id);
        if !self.by_key.contains(&entry) {
            return;
        }
        Arc::make_mut(&mut self.by_key).remove(&entry);
        Arc::make_mut(&mut self.by_id).remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: TargetId) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it held.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(id).into_iter().collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key = Arc::default();
        self.by_id = Arc::default();
        keys
    }

    pub fn references_for_id(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .map(|(entry, _)| entry == key)
            .unwrap_or(false)
    }
}
