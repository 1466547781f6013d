use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::{Direction, FieldFilter, FilterOperator, Target};
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment, MutableDocument,
    ResourcePath, SnapshotVersion,
};
use crate::firestore::value::FirestoreValue;

/// How much of a target a field index can answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No index applies.
    None,
    /// An index narrows the candidates but the query still has to be
    /// re-evaluated, and a limit cannot be applied on the index.
    Partial,
    /// An index serves every filter and order-by of the target.
    Full,
}

/// Collection-parent bookkeeping for collection group queries plus the
/// client-side field indexes.
pub trait IndexManager {
    /// Records that documents exist in `collection_path`.
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath);

    /// Paths of every known parent of a collection with id `collection_id`.
    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath>;

    /// Stores `index` under a fresh id and returns it.
    fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex;

    fn delete_field_index(&mut self, index_id: i32);

    fn delete_all_field_indexes(&mut self);

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex>;

    fn get_index_type(&self, target: &Target) -> IndexType;

    /// Creates an index covering `target` unless a full one already exists.
    /// The returned index still has to be backfilled with
    /// [`IndexManager::update_index_entries`].
    fn create_target_indexes(&mut self, target: &Target) -> Option<FieldIndex>;

    /// Keys of the documents the best index considers candidates for
    /// `target`, or `None` when no index applies.
    fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>>;

    /// Offset up to which the indexes serving `target` are complete.
    fn get_min_offset(&self, target: &Target) -> IndexOffset;

    fn update_index_entries(&mut self, doc: &MutableDocument);

    fn remove_index_entries(&mut self, key: &DocumentKey);
}

#[derive(Clone, Debug)]
pub struct MemoryIndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    field_indexes: BTreeMap<i32, FieldIndex>,
    /// Per index, the segment values of every indexed document. Shared
    /// between clones until written.
    entries: BTreeMap<i32, Arc<BTreeMap<DocumentKey, Vec<FirestoreValue>>>>,
    next_index_id: i32,
    indexed_read_time: SnapshotVersion,
}

impl Default for MemoryIndexManager {
    fn default() -> Self {
        Self {
            collection_parents: BTreeMap::new(),
            field_indexes: BTreeMap::new(),
            entries: BTreeMap::new(),
            next_index_id: 1,
            indexed_read_time: SnapshotVersion::min(),
        }
    }
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the index serving the most filters of `target`.
    fn best_index(&self, target: &Target) -> Option<&FieldIndex> {
        if target.is_document_target() {
            return None;
        }
        let group = collection_group_of(target)?;
        self.field_indexes
            .values()
            .filter(|index| index.collection_group == group)
            .filter_map(|index| served_filter_count(index, target).map(|count| (count, index)))
            .max_by_key(|(count, index)| (*count, index.segments.len()))
            .map(|(_, index)| index)
    }
}

fn collection_group_of(target: &Target) -> Option<&str> {
    match target.collection_group() {
        Some(group) => Some(group),
        None => target.path().last_segment(),
    }
}

fn segment_serves(segment: &IndexSegment, filter: &FieldFilter) -> bool {
    if filter.field() != &segment.field {
        return false;
    }
    match segment.kind {
        IndexKind::Contains => matches!(
            filter.operator(),
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
        ),
        IndexKind::Ascending | IndexKind::Descending => matches!(
            filter.operator(),
            FilterOperator::Equal
                | FilterOperator::In
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
        ),
    }
}

/// Number of target filters the index serves, or `None` when some segment
/// is neither backed by a filter nor by an order-by of the target.
fn served_filter_count(index: &FieldIndex, target: &Target) -> Option<usize> {
    if index.segments.is_empty() {
        return None;
    }
    for segment in &index.segments {
        let backed_by_filter = target
            .filters()
            .iter()
            .any(|filter| segment_serves(segment, filter));
        let backed_by_order = segment.kind != IndexKind::Contains
            && target
                .order_by()
                .iter()
                .any(|order| order.field() == &segment.field);
        if !backed_by_filter && !backed_by_order {
            return None;
        }
    }
    Some(
        target
            .filters()
            .iter()
            .filter(|filter| {
                index
                    .segments
                    .iter()
                    .any(|segment| segment_serves(segment, filter))
            })
            .count(),
    )
}

fn is_full_index(index: &FieldIndex, target: &Target) -> bool {
    let filters_served = target.filters().iter().all(|filter| {
        index
            .segments
            .iter()
            .any(|segment| segment_serves(segment, filter))
    });
    let order_served = target
        .order_by()
        .iter()
        .filter(|order| !order.field().is_key_field())
        .all(|order| {
            index
                .directional_segments()
                .any(|segment| segment.field == *order.field())
        });
    filters_served && order_served
}

fn segments_for_target(target: &Target) -> Vec<IndexSegment> {
    let mut segments: Vec<IndexSegment> = Vec::new();
    let mut seen: BTreeSet<FieldPath> = BTreeSet::new();
    let direction_of = |field: &FieldPath| {
        target
            .order_by()
            .iter()
            .find(|order| order.field() == field)
            .map(|order| order.direction())
    };
    let kind_for = |direction: Option<Direction>| match direction {
        Some(Direction::Descending) => IndexKind::Descending,
        _ => IndexKind::Ascending,
    };

    let user_filters = target
        .filters()
        .iter()
        .filter(|filter| !filter.field().is_key_field());

    // Equality and array filters first, then the inequality, then order-bys.
    for filter in user_filters.clone() {
        let array_filter = matches!(
            filter.operator(),
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
        );
        if array_filter {
            if !segments.iter().any(|s| s.kind == IndexKind::Contains) {
                segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Contains));
            }
        } else if !filter.is_inequality() && seen.insert(filter.field().clone()) {
            segments.push(IndexSegment::new(
                filter.field().clone(),
                kind_for(direction_of(filter.field())),
            ));
        }
    }
    for filter in user_filters.filter(|filter| filter.is_inequality()) {
        if seen.insert(filter.field().clone()) {
            segments.push(IndexSegment::new(
                filter.field().clone(),
                kind_for(direction_of(filter.field())),
            ));
        }
    }
    for order in target.order_by() {
        if !order.field().is_key_field() && seen.insert(order.field().clone()) {
            segments.push(IndexSegment::new(
                order.field().clone(),
                kind_for(Some(order.direction())),
            ));
        }
    }
    segments
}

/// Values of `doc` for each segment, or `None` when the document lacks one
/// of the indexed fields.
fn index_values(index: &FieldIndex, doc: &MutableDocument) -> Option<Vec<FirestoreValue>> {
    if !doc.is_found_document() || !doc.key().has_collection_id(&index.collection_group) {
        return None;
    }
    index
        .segments
        .iter()
        .map(|segment| {
            let value = doc.field(&segment.field)?;
            if segment.kind == IndexKind::Contains && value.as_array().is_none() {
                return None;
            }
            Some(value.clone())
        })
        .collect()
}

fn matches_target_path(target: &Target, key: &DocumentKey) -> bool {
    if target.collection_group().is_some() {
        target.path().is_prefix_of(key.path())
    } else {
        target.path().is_immediate_parent_of(key.path())
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex {
        let index = FieldIndex {
            index_id: self.next_index_id,
            ..index
        };
        self.next_index_id += 1;
        self.entries.insert(index.index_id, Arc::default());
        self.field_indexes.insert(index.index_id, index.clone());
        index
    }

    fn delete_field_index(&mut self, index_id: i32) {
        self.field_indexes.remove(&index_id);
        self.entries.remove(&index_id);
    }

    fn delete_all_field_indexes(&mut self) {
        self.field_indexes.clear();
        self.entries.clear();
    }

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex> {
        self.field_indexes
            .values()
            .filter(|index| {
                collection_group
                    .map(|group| index.collection_group == group)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn get_index_type(&self, target: &Target) -> IndexType {
        match self.best_index(target) {
            None => IndexType::None,
            Some(index) if is_full_index(index, target) => IndexType::Full,
            Some(_) => IndexType::Partial,
        }
    }

    fn create_target_indexes(&mut self, target: &Target) -> Option<FieldIndex> {
        if target.is_document_target() || self.get_index_type(target) == IndexType::Full {
            return None;
        }
        let group = collection_group_of(target)?.to_string();
        let segments = segments_for_target(target);
        if segments.is_empty() {
            return None;
        }
        let candidate = FieldIndex::new(0, group, segments);
        if self
            .field_indexes
            .values()
            .any(|existing| existing.same_shape(&candidate))
        {
            return None;
        }
        log::debug!(
            "index manager: creating index on {} with {} segments",
            candidate.collection_group,
            candidate.segments.len()
        );
        Some(self.add_field_index(candidate))
    }

    fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>> {
        let index = self.best_index(target)?;
        let entries = self.entries.get(&index.index_id)?;
        let keys = entries
            .iter()
            .filter(|(key, _)| matches_target_path(target, key))
            .filter(|(_, values)| {
                index
                    .segments
                    .iter()
                    .zip(values.iter())
                    .all(|(segment, value)| {
                        target
                            .filters()
                            .iter()
                            .filter(|filter| segment_serves(segment, filter))
                            .all(|filter| filter.matches_value(Some(value)))
                    })
            })
            .map(|(key, _)| key.clone())
            .collect();
        Some(keys)
    }

    fn get_min_offset(&self, _target: &Target) -> IndexOffset {
        // Entries are maintained on every cache write, so the indexes are
        // complete up to the newest document read.
        IndexOffset::new(self.indexed_read_time, None, -1)
    }

    fn update_index_entries(&mut self, doc: &MutableDocument) {
        if doc.read_time() > self.indexed_read_time {
            self.indexed_read_time = doc.read_time();
        }
        for index in self.field_indexes.values() {
            let Some(entries) = self.entries.get_mut(&index.index_id) else {
                continue;
            };
            match index_values(index, doc) {
                Some(values) => {
                    Arc::make_mut(entries).insert(doc.key().clone(), values);
                }
                None if entries.contains_key(doc.key()) => {
                    Arc::make_mut(entries).remove(doc.key());
                }
                None => {}
            }
        }
    }

    fn remove_index_entries(&mut self, key: &DocumentKey) {
        for entries in self.entries.values_mut() {
            if entries.contains_key(key) {
                Arc::make_mut(entries).remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{OrderBy, Query};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_single(*field), value.clone());
        }
        let mut doc = MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        );
        doc.set_read_time(SnapshotVersion::from_micros(1));
        doc
    }

    fn filter(field: &str, op: FilterOperator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(FieldPath::from_single(field), op, value).unwrap()
    }

    #[test]
    fn collection_parents_are_tracked_per_id() {
        let mut manager = MemoryIndexManager::new();
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms/a/messages").unwrap());
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms/b/messages").unwrap());
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms").unwrap());
        assert_eq!(manager.get_collection_parents("messages").len(), 2);
        assert_eq!(
            manager.get_collection_parents("rooms"),
            vec![ResourcePath::root()]
        );
    }

    #[test]
    fn created_index_serves_equality_query() {
        let mut manager = MemoryIndexManager::new();
        let target = Query::collection("c")
            .unwrap()
            .with_filter(filter("a", FilterOperator::Equal, 1.into()))
            .to_target();
        assert_eq!(manager.get_index_type(&target), IndexType::None);

        let index = manager.create_target_indexes(&target).unwrap();
        assert_eq!(index.segments.len(), 1);
        assert!(manager.create_target_indexes(&target).is_none());
        assert_eq!(manager.get_index_type(&target), IndexType::Full);

        manager.update_index_entries(&doc("c/x", &[("a", 1.into())]));
        manager.update_index_entries(&doc("c/y", &[("a", 2.into())]));
        manager.update_index_entries(&doc("c/z", &[("b", 1.into())]));
        manager.update_index_entries(&doc("d/x", &[("a", 1.into())]));

        let keys = manager.get_documents_matching_target(&target).unwrap();
        assert_eq!(keys, vec![DocumentKey::from_string("c/x").unwrap()]);

        manager.remove_index_entries(&DocumentKey::from_string("c/x").unwrap());
        assert!(manager.get_documents_matching_target(&target).unwrap().is_empty());
    }

    #[test]
    fn unserved_filters_make_index_partial() {
        let mut manager = MemoryIndexManager::new();
        let ordered = Query::collection("c")
            .unwrap()
            .with_order_by(OrderBy::descending(FieldPath::from_single("a")))
            .to_target();
        manager.create_target_indexes(&ordered);

        let with_not_equal = Query::collection("c")
            .unwrap()
            .with_filter(filter("a", FilterOperator::NotEqual, 1.into()))
            .to_target();
        assert_eq!(manager.get_index_type(&with_not_equal), IndexType::Partial);
    }
}
