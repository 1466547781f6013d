use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Options for `set` writes: replace the document, merge every field in the
/// data, or merge only the listed fields.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    pub merge: bool,
    /// Takes precedence over `merge` when present.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = BTreeSet::new();
        for field in fields {
            if seen.insert(field.clone()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument(
                "merge_fields requires at least one field path",
            ));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Set,
    MergeSet,
    Update,
}

/// User data with its sentinels pulled out.
#[derive(Default)]
struct ParsedFields {
    data: BTreeMap<String, FirestoreValue>,
    transforms: Vec<FieldTransform>,
    /// Leaf paths carrying plain values.
    value_paths: Vec<FieldPath>,
    deleted_paths: Vec<FieldPath>,
}

/// Builds the mutation for a `set` of `data` on `key`.
pub fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let kind = if options.is_merge() {
        WriteKind::MergeSet
    } else {
        WriteKind::Set
    };
    let mut parsed = ParsedFields::default();
    parsed.data = parse_map(&data, &[], kind, &mut parsed)?;

    if !options.is_merge() {
        return Ok(Mutation::Set {
            key,
            value: MapValue::new(parsed.data),
            precondition: Precondition::None,
            field_transforms: parsed.transforms,
        });
    }

    let (mask, transforms, value) = match &options.merge_fields {
        Some(fields) => {
            let available: BTreeSet<FieldPath> = parsed
                .value_paths
                .iter()
                .chain(parsed.deleted_paths.iter())
                .chain(parsed.transforms.iter().map(|transform| &transform.field))
                .cloned()
                .collect();
            for field in fields {
                if !available.iter().any(|path| field.is_prefix_of(path)) {
                    return Err(invalid_argument(format!(
                        "Field '{field}' is specified in your field mask but missing from your input data."
                    )));
                }
            }
            let covered = |path: &FieldPath| fields.iter().any(|field| field.is_prefix_of(path));
            let transforms: Vec<FieldTransform> = parsed
                .transforms
                .into_iter()
                .filter(|transform| covered(&transform.field))
                .collect();
            let source = MapValue::new(parsed.data);
            let mut value = MapValue::empty();
            let mut mask = FieldMask::empty();
            for field in fields {
                if transforms.iter().any(|transform| &transform.field == field) {
                    continue;
                }
                if let Some(field_value) = source.field(field) {
                    value.set(field, field_value.clone());
                }
                mask.insert(field.clone());
            }
            (mask, transforms, value)
        }
        None => {
            let mask = FieldMask::new(
                parsed
                    .value_paths
                    .into_iter()
                    .chain(parsed.deleted_paths),
            );
            (mask, parsed.transforms, MapValue::new(parsed.data))
        }
    };

    Ok(Mutation::Patch {
        key,
        data: value,
        field_mask: mask,
        precondition: Precondition::None,
        field_transforms: transforms,
    })
}

/// Builds the mutation for an `update` of `data` on `key`. Keys are
/// dot-separated field paths; the document must exist.
pub fn parse_update_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<Mutation> {
    let mut fields = Vec::with_capacity(data.len());
    for (path, value) in data {
        fields.push((FieldPath::from_dot_separated(&path)?, value));
    }
    parse_update_fields(key, fields)
}

/// Like [`parse_update_data`] with explicit field paths, so segments may
/// contain dots.
pub fn parse_update_fields(
    key: DocumentKey,
    fields: Vec<(FieldPath, FirestoreValue)>,
) -> FirestoreResult<Mutation> {
    if fields.is_empty() {
        return Err(invalid_argument(
            "update requires at least one field/value pair",
        ));
    }
    for (index, (path, _)) in fields.iter().enumerate() {
        if fields[..index]
            .iter()
            .any(|(other, _)| other.is_prefix_of(path) || path.is_prefix_of(other))
        {
            return Err(invalid_argument(format!(
                "Field '{path}' conflicts with another field in the same update"
            )));
        }
    }

    let mut parsed = ParsedFields::default();
    let mut value = MapValue::empty();
    let mut mask = FieldMask::empty();
    for (path, field_value) in fields {
        match field_value.kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => {
                mask.insert(path);
            }
            ValueKind::Sentinel(sentinel) => {
                parsed
                    .transforms
                    .push(transform_from_sentinel(path, sentinel.clone())?);
            }
            ValueKind::Map(map) => {
                let nested = parse_map(map.fields(), path.segments(), WriteKind::Update, &mut parsed)?;
                value.set(&path, FirestoreValue::from_map(nested));
                mask.insert(path);
            }
            _ => {
                assert_no_sentinel_in_value(&field_value, &path)?;
                value.set(&path, field_value.clone());
                mask.insert(path);
            }
        }
    }

    Ok(Mutation::Patch {
        key,
        data: value,
        field_mask: mask,
        precondition: Precondition::Exists(true),
        field_transforms: parsed.transforms,
    })
}

fn parse_map(
    data: &BTreeMap<String, FirestoreValue>,
    parent_segments: &[String],
    kind: WriteKind,
    parsed: &mut ParsedFields,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent_segments.to_vec();
        segments.push(key.clone());
        let field_path = FieldPath::new(segments.clone())?;
        match value.kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => {
                if kind != WriteKind::MergeSet {
                    return Err(invalid_argument(format!(
                        "delete_field() can only be used with update and set with merge (found in field '{field_path}')"
                    )));
                }
                parsed.deleted_paths.push(field_path);
            }
            ValueKind::Sentinel(sentinel) => {
                parsed
                    .transforms
                    .push(transform_from_sentinel(field_path, sentinel.clone())?);
            }
            ValueKind::Map(map) if !map.fields().is_empty() => {
                let nested = parse_map(map.fields(), &segments, kind, parsed)?;
                cleaned.insert(key.clone(), FirestoreValue::from_map(nested));
            }
            _ => {
                assert_no_sentinel_in_value(value, &field_path)?;
                parsed.value_paths.push(field_path);
                cleaned.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(cleaned)
}

fn transform_from_sentinel(
    field_path: FieldPath,
    sentinel: SentinelValue,
) -> FirestoreResult<FieldTransform> {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in &elements {
                assert_no_sentinel_in_value(element, &field_path)?;
            }
            TransformOperation::ArrayUnion(elements)
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in &elements {
                assert_no_sentinel_in_value(element, &field_path)?;
            }
            TransformOperation::ArrayRemove(elements)
        }
        SentinelValue::NumericIncrement(operand) => match operand.kind() {
            ValueKind::Integer(_) | ValueKind::Double(_) => {
                TransformOperation::NumericIncrement(*operand)
            }
            _ => {
                return Err(invalid_argument(
                    "increment() requires a numeric operand",
                ))
            }
        },
        SentinelValue::Delete => {
            return Err(invalid_argument(format!(
                "delete_field() cannot be used here (field '{field_path}')"
            )))
        }
    };
    Ok(FieldTransform::new(field_path, operation))
}

fn assert_no_sentinel_in_value(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays (field '{context}')."
        ))),
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel_in_value(element, context)?;
            }
            Ok(())
        }
        ValueKind::Map(map) => {
            for element in map.fields().values() {
                assert_no_sentinel_in_value(element, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
