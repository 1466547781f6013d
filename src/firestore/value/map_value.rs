use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Nested map of fields. Document data is a `MapValue` at the top level.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a (possibly nested) field.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Writes `value` at `path`, replacing any non-map intermediate value.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.kind_mut() {
                ValueKind::Map(map) => map,
                _ => return,
            };
        }
        current.fields.insert(last.clone(), value);
    }

    /// Removes the field at `path`. Missing parents are left untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            current = match current.fields.get_mut(segment).map(FirestoreValue::kind_mut) {
                Some(ValueKind::Map(map)) => map,
                _ => return,
            };
        }
        current.fields.remove(last);
    }

    /// Applies a batch of sets (`Some`) and deletes (`None`).
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Mask of every leaf field. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self, None, &mut paths);
        FieldMask::new(paths)
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + value.estimate_byte_size())
            .sum()
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: Option<&FieldPath>, out: &mut Vec<FieldPath>) {
    for (key, value) in &map.fields {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => FieldPath::from_single(key.clone()),
        };
        match value.as_map() {
            Some(nested) if !nested.is_empty() => collect_leaf_paths(nested, Some(&path), out),
            _ => out.push(path),
        }
    }
}
