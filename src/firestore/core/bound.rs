use std::cmp::Ordering;

use crate::firestore::core::filter::reference_path;
use crate::firestore::core::OrderBy;
use crate::firestore::model::Document;
use crate::firestore::value::{canonical_id, compare_values, FirestoreValue};

/// Query cursor: a position along the normalized order-by plus whether the
/// position itself is part of the result.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    /// Compares the bound to `doc` along `order_by`, honoring directions.
    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field().is_key_field() {
                match reference_path(component) {
                    Some(path) => path.cmp(doc.key().path()),
                    None => Ordering::Less,
                }
            } else {
                match doc.field(order.field()) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Less,
                }
            };
            let ordering = order.direction().apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether a start bound lets `doc` through.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether an end bound lets `doc` through.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_position(&self) -> String {
        self.position
            .iter()
            .map(canonical_id)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Direction;
    use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, n: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(BTreeMap::from([("n".to_string(), FirestoreValue::from_integer(n))])),
        )
    }

    #[test]
    fn inclusive_and_exclusive_start() {
        let order = vec![
            OrderBy::ascending(FieldPath::from_single("n")),
            OrderBy::ascending(FieldPath::key_path()),
        ];
        let at = Bound::new(vec![2.into()], true);
        let after = Bound::new(vec![2.into()], false);
        assert!(at.sorts_before_document(&order, &doc("c/a", 2)));
        assert!(!after.sorts_before_document(&order, &doc("c/a", 2)));
        assert!(after.sorts_before_document(&order, &doc("c/a", 3)));
    }

    #[test]
    fn descending_order_flips_bounds() {
        let order = vec![OrderBy::new(FieldPath::from_single("n"), Direction::Descending)];
        let end_before = Bound::new(vec![2.into()], false);
        assert!(end_before.sorts_after_document(&order, &doc("c/a", 3)));
        assert!(!end_before.sorts_after_document(&order, &doc("c/a", 1)));
    }

    #[test]
    fn key_components_compare_references() {
        let order = vec![OrderBy::ascending(FieldPath::key_path())];
        let start = Bound::new(vec![FirestoreValue::from_reference("c/b")], true);
        assert!(!start.sorts_before_document(&order, &doc("c/a", 0)));
        assert!(start.sorts_before_document(&order, &doc("c/b", 0)));
    }
}
