use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::BytesValue;

/// One decoded message of the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: BytesValue,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entered or changed in the listed targets, or left the
/// removed ones while still existing.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: MutableDocument,
}

/// The document was deleted as of `read_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document no longer matches the targets; its state is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

/// Server-side document count of a target, optionally with a bloom filter
/// of the names it still contains.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParts>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParts {
    pub bitmap: Vec<u8>,
    pub padding: u8,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

/// Global snapshot version carried by a listen response. Only target
/// changes addressed to every target advance it.
pub fn decode_snapshot_version(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match target_change.get("readTime").and_then(JsonValue::as_str) {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .map(|token| {
            BytesValue::from_base64(token)
                .map_err(|err| invalid_argument(format!("Invalid resume token: {err}")))
        })
        .transpose()?
        .unwrap_or_default();

    let read_time = decode_optional_version(serializer, value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::from_rpc_status(
                cause.code,
                cause.message.unwrap_or_else(|| "watch target error".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let updated_target_ids = numeric_array(value.get("targetIds"));
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids,
        removed_target_ids,
        document,
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = decode_optional_version(serializer, value.get("readTime"))?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentDelete(DocumentDelete {
        key,
        read_time,
        removed_target_ids,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentRemove(DocumentRemove {
        key,
        removed_target_ids,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(decode_bloom_filter_parts)
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn decode_bloom_filter_parts(value: &JsonValue) -> FirestoreResult<BloomFilterParts> {
    let bits = value.get("bits");
    let bitmap = bits
        .and_then(|bits| bits.get("bitmap"))
        .and_then(JsonValue::as_str)
        .map(|bitmap| {
            BytesValue::from_base64(bitmap)
                .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))
        })
        .transpose()?
        .unwrap_or_default();
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let hash_count = value
        .get("hashCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or(0);
    Ok(BloomFilterParts {
        bitmap: bitmap.as_slice().to_vec(),
        padding: padding.min(u64::from(u8::MAX)) as u8,
        hash_count: hash_count as i32,
    })
}

fn decode_optional_version(
    serializer: &JsonProtoSerializer,
    value: Option<&JsonValue>,
) -> FirestoreResult<SnapshotVersion> {
    match value.and_then(JsonValue::as_str) {
        Some(timestamp) => serializer.decode_version(timestamp),
        None => Ok(SnapshotVersion::min()),
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "NO_CHANGE" => TargetChangeState::NoChange,
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BytesValue::from(vec![1u8, 2, 3]).to_base64(),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token.as_slice(), &[1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.read_time.is_min());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn decodes_document_change_and_delete() {
        let change = json!({
            "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "fields": { "n": { "integerValue": "3" } },
                    "updateTime": "2024-01-01T00:00:01Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });
        let Some(WatchChange::DocumentChange(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected document change");
        };
        assert_eq!(change.updated_target_ids, vec![2]);
        assert_eq!(change.removed_target_ids, vec![4]);
        assert!(change.document.is_found_document());
        assert_eq!(change.document.key().path().canonical_string(), "rooms/a");

        let delete = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/b",
                "readTime": "2024-01-01T00:00:02Z",
                "removedTargetIds": [2]
            }
        });
        let Some(WatchChange::DocumentDelete(delete)) =
            decode_watch_change(&serializer(), &delete).unwrap()
        else {
            panic!("expected document delete");
        };
        assert_eq!(delete.removed_target_ids, vec![2]);
        assert!(!delete.read_time.is_min());
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let filter = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BytesValue::from(vec![0xffu8]).to_base64(), "padding": 1 },
                    "hashCount": 2
                }
            }
        });
        let Some(WatchChange::ExistenceFilter(filter)) =
            decode_watch_change(&serializer(), &filter).unwrap()
        else {
            panic!("expected existence filter");
        };
        assert_eq!(filter.count, 3);
        assert_eq!(
            filter.unchanged_names,
            Some(BloomFilterParts {
                bitmap: vec![0xff],
                padding: 1,
                hash_count: 2,
            })
        );
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let global = json!({
            "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "2024-01-01T00:00:05Z" }
        });
        let scoped = json!({
            "targetChange": { "targetIds": [2], "readTime": "2024-01-01T00:00:05Z" }
        });
        assert!(!decode_snapshot_version(&serializer(), &global).unwrap().is_min());
        assert!(decode_snapshot_version(&serializer(), &scoped).unwrap().is_min());
    }
}
