use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, Direction, FieldFilter, FilterOperator, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, FieldTransform, GeoPoint, MutableDocument, Mutation,
    MutationResult, Precondition, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};
use crate::util::assert::fail;

/// Converts between the client model and the JSON encoding of the backend
/// protocol messages.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.document_name(key)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.database_id.relative_path(name)?)
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        version.timestamp().to_rfc3339()
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Timestamp::from_rfc3339(value).map(SnapshotVersion::new)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => {
                if double.is_nan() {
                    json!({ "doubleValue": "NaN" })
                } else if double.is_infinite() {
                    let label = if *double > 0.0 { "Infinity" } else { "-Infinity" };
                    json!({ "doubleValue": label })
                } else {
                    json!({ "doubleValue": double })
                }
            }
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": timestamp.to_rfc3339() })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(path) => json!({
                "referenceValue": format!("{}/{}", self.documents_root(), path)
            }),
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values = array
                    .values()
                    .iter()
                    .map(|value| self.encode_value(value))
                    .collect::<Vec<_>>();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({
                "mapValue": {
                    "fields": self.encode_map_fields(map)
                }
            }),
            ValueKind::ServerTimestamp(_) => {
                fail("pending server timestamps are never sent to the backend")
            }
            ValueKind::Sentinel(_) => {
                fail("sentinel values must be converted to field transforms before encoding")
            }
        }
    }

    pub fn encode_map_fields(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (key, value) in map.fields() {
            fields.insert(key.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected object for map value"))?;
        let fields_object = match map.get("fields") {
            Some(fields_value) => fields_value
                .as_object()
                .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
            None => return Ok(MapValue::empty()),
        };

        let mut fields = BTreeMap::new();
        for (key, value) in fields_object {
            fields.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(fields))
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => match value.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            let timestamp = timestamp_value
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
            return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(
                timestamp,
            )?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let encoded = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let decoded = BytesValue::from_base64(encoded)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(decoded));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let path = self.database_id.relative_path(name)?;
            return Ok(FirestoreValue::from_reference(path.canonical_string()));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point
                .get("latitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            let longitude = geo_point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
                latitude, longitude,
            )?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(decoded));
        }
        if let Some(map_value) = object.get("mapValue") {
            return Ok(FirestoreValue::from_map_value(
                self.decode_map_value(map_value)?,
            ));
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let data = self.decode_map_value(document)?;
        let version = document
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing updateTime"))
            .and_then(|time| self.decode_version(time))?;
        if version.is_min() {
            return Err(invalid_argument("Document updateTime must not be zero"));
        }
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".to_string(), self.encode_document(key, value));
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert("update".to_string(), self.encode_document(key, data));
                let paths = field_mask
                    .fields()
                    .iter()
                    .map(FieldPath::canonical_string)
                    .collect::<Vec<_>>();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            let encoded = transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect::<Vec<_>>();
            write.insert("updateTransforms".to_string(), JsonValue::Array(encoded));
        }

        if let Some(precondition) = self.encode_precondition(&mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn encode_document(&self, key: &DocumentKey, data: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_map_fields(data)
        })
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(*version) }))
            }
        }
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": self.encode_values(elements) }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": self.encode_values(elements) }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    fn encode_values(&self, values: &[FirestoreValue]) -> Vec<JsonValue> {
        values.iter().map(|value| self.encode_value(value)).collect()
    }

    /// Decodes the `writeResults` of a write response. Results without an
    /// update time (deletes, verifies) take the commit version.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(results) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        results
            .iter()
            .map(|result| self.decode_write_result(result, commit_version))
            .collect()
    }

    fn decode_write_result(
        &self,
        result: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match result.get("updateTime").and_then(JsonValue::as_str) {
            Some(update_time) => self.decode_version(update_time)?,
            None => commit_version,
        };
        let transform_results = match result.get("transformResults").and_then(JsonValue::as_array)
        {
            Some(values) => values
                .iter()
                .map(|value| self.decode_value(value))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult::new(version, transform_results))
    }

    /// Builds the `addTarget` payload for a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target.path().canonical_string())] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(target_data.resume_token.to_base64()),
            );
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        JsonValue::Object(encoded)
    }

    fn resource_name(&self, relative: String) -> String {
        if relative.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), relative)
        }
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let path = target.path();
        let (parent, from) = match target.collection_group() {
            Some(group) => (
                self.resource_name(path.canonical_string()),
                json!([{ "collectionId": group, "allDescendants": true }]),
            ),
            None => {
                let collection_id = path.last_segment().unwrap_or_default();
                (
                    self.resource_name(path.without_last().canonical_string()),
                    json!([{ "collectionId": collection_id }]),
                )
            }
        };

        let mut structured = serde_json::Map::new();
        structured.insert("from".to_string(), from);
        if let Some(filter) = self.encode_filters(target.filters()) {
            structured.insert("where".to_string(), filter);
        }
        if !target.order_by().is_empty() {
            let order_by = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": match order.direction() {
                            Direction::Ascending => "ASCENDING",
                            Direction::Descending => "DESCENDING",
                        }
                    })
                })
                .collect::<Vec<_>>();
            structured.insert("orderBy".to_string(), JsonValue::Array(order_by));
        }
        if let Some(limit) = target.limit() {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(start_at) = target.start_at() {
            structured.insert(
                "startAt".to_string(),
                self.encode_cursor(start_at, start_at.inclusive()),
            );
        }
        if let Some(end_at) = target.end_at() {
            structured.insert(
                "endAt".to_string(),
                self.encode_cursor(end_at, !end_at.inclusive()),
            );
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured)
        })
    }

    fn encode_cursor(&self, bound: &Bound, before: bool) -> JsonValue {
        json!({
            "values": self.encode_values(bound.position()),
            "before": before
        })
    }

    fn encode_filters(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        let mut encoded = filters
            .iter()
            .map(|filter| self.encode_filter(filter))
            .collect::<Vec<_>>();
        match encoded.len() {
            0 => None,
            1 => encoded.pop(),
            _ => Some(json!({
                "compositeFilter": { "op": "AND", "filters": encoded }
            })),
        }
    }

    fn encode_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match (filter.operator(), filter.value()) {
            (FilterOperator::Equal, value) if value.is_null() => Some("IS_NULL"),
            (FilterOperator::Equal, value) if value.is_nan() => Some("IS_NAN"),
            (FilterOperator::NotEqual, value) if value.is_null() => Some("IS_NOT_NULL"),
            (FilterOperator::NotEqual, value) if value.is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        if let Some(op) = unary {
            return json!({ "unaryFilter": { "field": field, "op": op } });
        }
        json!({
            "fieldFilter": {
                "field": field,
                "op": operator_name(filter.operator()),
                "value": self.encode_value(filter.value())
            }
        })
    }
}

fn operator_name(operator: FilterOperator) -> &'static str {
    match operator {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{OrderBy, Query};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::FieldMask;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::for_project("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn references_use_fully_qualified_names() {
        let serializer = serializer();
        let value = FirestoreValue::from_reference("rooms/a");
        let encoded = serializer.encode_value(&value);
        assert_eq!(
            encoded["referenceValue"],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        let decoded = serializer.decode_value(&encoded).unwrap();
        assert!(matches!(decoded.kind(), ValueKind::Reference(path) if path == "rooms/a"));
    }

    #[test]
    fn decodes_nested_document() {
        let serializer = serializer();
        let document = serializer
            .decode_document(&json!({
                "name": "projects/project/databases/(default)/documents/rooms/a",
                "fields": {
                    "name": { "stringValue": "Ada" },
                    "tags": { "arrayValue": { "values": [ { "integerValue": "1" } ] } },
                    "meta": { "mapValue": { "fields": { "ok": { "booleanValue": true } } } },
                    "ratio": { "doubleValue": "NaN" }
                },
                "updateTime": "2024-01-01T00:00:01.5Z"
            }))
            .unwrap();
        assert_eq!(document.key(), &key("rooms/a"));
        assert_eq!(document.version().timestamp(), Timestamp::new(1_704_067_201, 500_000_000));
        let path = FieldPath::from_dot_separated("meta.ok").unwrap();
        assert_eq!(document.field(&path), Some(&FirestoreValue::from_bool(true)));
        let ratio = FieldPath::from_single("ratio");
        assert!(document.field(&ratio).unwrap().is_nan());
    }

    #[test]
    fn encodes_patch_with_mask_transforms_and_precondition() {
        let serializer = serializer();
        let mut data = BTreeMap::new();
        data.insert("n".to_string(), FirestoreValue::from_integer(1));
        let mutation = Mutation::Patch {
            key: key("rooms/a"),
            data: MapValue::new(data),
            field_mask: FieldMask::new([FieldPath::from_single("n")]),
            precondition: Precondition::Exists(true),
            field_transforms: vec![FieldTransform::new(
                FieldPath::from_single("at"),
                TransformOperation::ServerTimestamp,
            )],
        };
        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(
            encoded["update"]["name"],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        assert_eq!(encoded["update"]["fields"]["n"]["integerValue"], "1");
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["n"]));
        assert_eq!(encoded["updateTransforms"][0]["setToServerValue"], "REQUEST_TIME");
        assert_eq!(encoded["currentDocument"]["exists"], true);

        let delete = serializer.encode_mutation(&Mutation::delete(key("rooms/b")));
        assert_eq!(
            delete,
            json!({ "delete": "projects/project/databases/(default)/documents/rooms/b" })
        );
    }

    #[test]
    fn write_results_fall_back_to_commit_version() {
        let serializer = serializer();
        let commit = SnapshotVersion::new(Timestamp::new(10, 0));
        let results = serializer
            .decode_write_results(
                Some(&json!([
                    { "updateTime": "1970-01-01T00:00:05Z",
                      "transformResults": [ { "integerValue": "7" } ] },
                    {}
                ])),
                commit,
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].version, SnapshotVersion::new(Timestamp::new(5, 0)));
        assert_eq!(results[0].transform_results, vec![FirestoreValue::from_integer(7)]);
        assert_eq!(results[1].version, commit);
    }

    #[test]
    fn encodes_query_target_with_resume_token() {
        let serializer = serializer();
        let query = Query::collection("rooms/a/messages")
            .unwrap()
            .where_field("n", FilterOperator::GreaterThan, FirestoreValue::from_integer(1))
            .unwrap()
            .with_order_by(OrderBy::descending(FieldPath::from_single("n")))
            .limit_to_first(5);
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1)
            .with_resume_token(BytesValue::from(vec![9]), SnapshotVersion::from_micros(5))
            .with_expected_count(3);
        let encoded = serializer.encode_target(&target_data);
        assert_eq!(encoded["targetId"], 2);
        assert_eq!(encoded["resumeToken"], BytesValue::from(vec![9]).to_base64());
        assert_eq!(encoded["expectedCount"], 3);
        assert_eq!(
            encoded["query"]["parent"],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        let structured = &encoded["query"]["structuredQuery"];
        assert_eq!(structured["from"][0]["collectionId"], "messages");
        assert_eq!(structured["where"]["fieldFilter"]["op"], "GREATER_THAN");
        assert_eq!(structured["orderBy"][0]["direction"], "DESCENDING");
        assert_eq!(structured["limit"], 5);
    }

    #[test]
    fn encodes_document_target() {
        let serializer = serializer();
        let target_data = TargetData::new(
            Target::for_document(&key("rooms/a")),
            3,
            TargetPurpose::LimboResolution,
            1,
        );
        let encoded = serializer.encode_target(&target_data);
        assert_eq!(
            encoded["documents"]["documents"][0],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        assert!(encoded.get("resumeToken").is_none());
    }
}
