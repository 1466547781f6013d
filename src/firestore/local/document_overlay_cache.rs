use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user store of the net pending mutation of each document.
pub trait DocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay>;

    /// Saves `overlays`, each attributed to `largest_batch_id`.
    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>);

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId);

    /// Overlays of the immediate children of `collection` whose batch id is
    /// greater than `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            let previous_batch = existing.largest_batch_id();
            if let Some(keys) = self.overlay_by_batch_id.get_mut(&previous_batch) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.overlay_by_batch_id.remove(&previous_batch);
                }
            }
        }
        self.overlay_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays
            .insert(key, Overlay::new(largest_batch_id, mutation));
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| {
                self.overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        if let Some(keys) = self.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let immediate_children_length = collection.len() + 1;
        self.overlays
            .range(DocumentKey::range_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                key.path().len() == immediate_children_length
                    && overlay.largest_batch_id() > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths
            .iter()
            .map(|path| (key(path), Mutation::set(key(path), MapValue::empty())))
            .collect()
    }

    #[test]
    fn newer_batch_replaces_overlay() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, overlays(&["c/a", "c/b"]));
        cache.save_overlays(2, overlays(&["c/a"]));

        assert_eq!(cache.get_overlay(&key("c/a")).unwrap().largest_batch_id(), 2);
        cache.remove_overlays_for_batch_id(1);
        assert!(cache.get_overlay(&key("c/b")).is_none());
        assert!(cache.get_overlay(&key("c/a")).is_some());
    }

    #[test]
    fn collection_scan_skips_subcollections_and_old_batches() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, overlays(&["rooms/a"]));
        cache.save_overlays(2, overlays(&["rooms/b", "rooms/b/messages/m", "users/a"]));

        let rooms = ResourcePath::from_string("rooms").unwrap();
        let all = cache.get_overlays_for_collection(&rooms, -1);
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a"), key("rooms/b")]);

        let recent = cache.get_overlays_for_collection(&rooms, 1);
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }
}
