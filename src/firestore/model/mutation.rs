use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};
use crate::util::hard_assert;

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
            Precondition::UpdateTime(version) => {
                doc.is_found_document() && doc.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Value shown locally before the backend has applied the transform.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::pending_server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => FirestoreValue::from_kind(
                ValueKind::Array(coerce_array(previous).union_with(elements)),
            ),
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_kind(
                ValueKind::Array(coerce_array(previous).remove_all(elements)),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Value stored once the backend acknowledged the write with `result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        result: FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            _ => result,
        }
    }

    /// Pre-write value an increment starts from, captured so the local view
    /// stays stable when the remote document changes underneath.
    pub fn base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_integer(left.saturating_add(*right))
        }
        _ => FirestoreValue::from_double(as_f64(base) + as_f64(operand)),
    }
}

fn as_f64(value: &FirestoreValue) -> f64 {
    match value.kind() {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => 0.0,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Result of applying one mutation on the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// One document change.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Updates the fields in `field_mask`; masked fields missing from `data`
    /// are deleted.
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Only checks the precondition on the backend; has no local effect.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields the mutation touches, or `None` when it replaces or deletes the
    /// whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch {
                field_mask,
                field_transforms,
                ..
            } => Some(field_mask.union(&FieldMask::new(
                field_transforms.iter().map(|t| t.field.clone()),
            ))),
            Mutation::Verify { .. } => Some(FieldMask::empty()),
            Mutation::Set { .. } | Mutation::Delete { .. } => None,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, doc: &mut MutableDocument, result: &MutationResult) {
        hard_assert(
            doc.key() == self.key(),
            "Can only apply a mutation to a document with the same key",
        );
        match self {
            Mutation::Set { value, .. } => {
                let transforms = self.server_transform_results(doc, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transforms);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                precondition,
                data: patch_data,
                field_mask,
                ..
            } => {
                if !precondition.is_valid_for(doc) {
                    // Applied on the backend without us knowing the base.
                    doc.convert_to_unknown_document(result.version);
                    return;
                }
                let transforms = self.server_transform_results(doc, &result.transform_results);
                let mut data = doc.data().clone();
                data.set_all(patch_entries(patch_data, field_mask));
                data.set_all(transforms);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the mutation to the local view of `doc`.
    ///
    /// `previous_mask` tracks the fields changed so far; `None` means the
    /// whole document was replaced. Returns the updated mask.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        hard_assert(
            doc.key() == self.key(),
            "Can only apply a mutation to a document with the same key",
        );
        if !self.precondition().is_valid_for(doc) {
            return previous_mask;
        }
        match self {
            Mutation::Set { value, .. } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data: patch_data,
                field_mask,
                field_transforms,
                ..
            } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = doc.data().clone();
                data.set_all(patch_entries(patch_data, field_mask));
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found_document(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union(field_mask).union(&FieldMask::new(
                        field_transforms.iter().map(|t| t.field.clone()),
                    ))
                })
            }
            Mutation::Delete { .. } => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Base values for transforms that depend on the current field value.
    pub fn extract_base_value(&self, doc: &MutableDocument) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in self.field_transforms() {
            let existing = doc.field(&transform.field);
            if let Some(value) = transform.operation.base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(&transform.field, value);
            }
        }
        base
    }

    fn server_transform_results(
        &self,
        doc: &MutableDocument,
        results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        let transforms = self.field_transforms();
        hard_assert(
            transforms.len() == results.len(),
            "server transform result count should match field transform count",
        );
        transforms
            .iter()
            .zip(results)
            .map(|(transform, result)| {
                let previous = doc.field(&transform.field);
                (
                    transform.field.clone(),
                    Some(
                        transform
                            .operation
                            .apply_to_remote_document(previous, result.clone()),
                    ),
                )
            })
            .collect()
    }

    fn local_transform_results(
        &self,
        doc: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms()
            .iter()
            .map(|transform| {
                let previous = doc.field(&transform.field);
                (
                    transform.field.clone(),
                    Some(
                        transform
                            .operation
                            .apply_to_local_view(previous, local_write_time),
                    ),
                )
            })
            .collect()
    }
}

fn patch_entries(
    data: &MapValue,
    field_mask: &FieldMask,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    field_mask
        .fields()
        .iter()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

/// Builds the single mutation that turns the remote document into the local
/// view `doc`, given the fields the pending batches touched (`None` for the
/// whole document). Returns `None` when there is nothing to overlay.
pub fn calculate_overlay_mutation(
    doc: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !doc.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if doc.is_no_document() {
            Mutation::delete(doc.key().clone())
        } else {
            Mutation::set(doc.key().clone(), doc.data().clone())
        });
    };

    let mut patch = MapValue::empty();
    let mut mask_paths = BTreeSet::new();
    for path in mask.fields() {
        if mask_paths.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = doc.field(&path).cloned();
        // A deleted nested field is expressed through its parent.
        if value.is_none() && path.len() > 1 {
            if let Some(parent) = path.parent() {
                path = parent;
                value = doc.field(&path).cloned();
            }
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        mask_paths.insert(path);
    }

    Some(Mutation::Patch {
        key: doc.key().clone(),
        data: patch,
        field_mask: FieldMask::new(mask_paths),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}
