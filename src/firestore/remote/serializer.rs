use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, CompositeOperator, Direction, FieldFilter, Filter, FilterOperator, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, Mutation, MutationResult, MutableDocument,
    ObjectValue, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

const LOG_TARGET: &str = "firestore::serializer";

/// Decoded write stream response.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: BytesValue,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

/// Converts between model types and the Firestore v1 JSON wire format.
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
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let relative = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!(
                "Tried to deserialize key from a different database: {name}"
            ))
        })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    /// Reads an optional timestamp field as a version; absent means `min`.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Ok(SnapshotVersion::new(parse_timestamp(text)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Watch document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let fields = decode_map_value(document)?;
        let version = self.decode_version(document.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument("Got a document without an update time"));
        }
        Ok(MutableDocument::new_found(
            key,
            version,
            ObjectValue::from_map(fields.fields().clone()),
        ))
    }

    /// `addTarget` payload for a watch request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(target_data.resume_token.to_base64()),
            );
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                json!(encode_timestamp(&target_data.snapshot_version.timestamp())),
            );
        } else {
            return JsonValue::Object(encoded);
        }

        if let Some(expected_count) = target_data.expected_count {
            encoded.insert("expectedCount".to_string(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unlisten_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, collection_id, all_descendants) = match &target.collection_group {
            Some(group) => (target.path.clone(), group.clone(), true),
            None => (
                target.path.without_last(),
                target.path.last_segment().unwrap_or_default().to_string(),
                false,
            ),
        };

        let mut structured = serde_json::Map::new();
        structured.insert(
            "from".to_string(),
            json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
        );
        if !target.filters.is_empty() {
            let filter = if target.filters.len() == 1 {
                self.encode_filter(&target.filters[0])
            } else {
                self.encode_composite(CompositeOperator::And, &target.filters)
            };
            structured.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field.canonical_string() },
                        "direction": match order.direction {
                            Direction::Ascending => "ASCENDING",
                            Direction::Descending => "DESCENDING",
                        },
                    })
                })
                .collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!({ "value": limit }));
        }
        if let Some(bound) = &target.start_at {
            structured.insert("startAt".to_string(), self.encode_cursor(bound, bound.inclusive));
        }
        if let Some(bound) = &target.end_at {
            structured.insert("endAt".to_string(), self.encode_cursor(bound, !bound.inclusive));
        }

        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field) => self.encode_field_filter(field),
            Filter::Composite(composite) => self.encode_composite(composite.op, &composite.filters),
        }
    }

    fn encode_composite(&self, op: CompositeOperator, filters: &[Filter]) -> JsonValue {
        json!({
            "compositeFilter": {
                "op": match op {
                    CompositeOperator::And => "AND",
                    CompositeOperator::Or => "OR",
                },
                "filters": filters.iter().map(|f| self.encode_filter(f)).collect::<Vec<_>>(),
            }
        })
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match (filter.op(), filter.value()) {
            (FilterOperator::Equal, value) if value.is_null() => Some("IS_NULL"),
            (FilterOperator::Equal, value) if value.is_nan() => Some("IS_NAN"),
            (FilterOperator::NotEqual, value) if value.is_null() => Some("IS_NOT_NULL"),
            (FilterOperator::NotEqual, value) if value.is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        if let Some(op) = unary {
            return json!({ "unaryFilter": { "field": field, "op": op } });
        }
        let op = match filter.op() {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::In => "IN",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::NotIn => "NOT_IN",
        };
        json!({
            "fieldFilter": {
                "field": field,
                "op": op,
                "value": encode_value(filter.value()),
            }
        })
    }

    fn encode_cursor(&self, bound: &Bound, before: bool) -> JsonValue {
        json!({
            "values": bound.position.iter().map(encode_value).collect::<Vec<_>>(),
            "before": before,
        })
    }

    /// First message of a write stream.
    pub fn encode_write_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &BytesValue, mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": stream_token.to_base64(),
            "writes": mutations.iter().map(|m| self.encode_mutation(m)).collect::<Vec<_>>(),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set(set) => {
                write.insert("update".to_string(), self.encode_document(&set.key, &set.value));
            }
            Mutation::Patch(patch) => {
                write.insert("update".to_string(), self.encode_document(&patch.key, &patch.data));
                let mask: Vec<String> = patch
                    .field_mask
                    .fields()
                    .iter()
                    .map(|field| field.canonical_string())
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            Mutation::Delete(delete) => {
                write.insert("delete".to_string(), json!(self.document_name(&delete.key)));
            }
            Mutation::Verify(verify) => {
                write.insert("verify".to_string(), json!(self.document_name(&verify.key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            write.insert(
                "updateTransforms".to_string(),
                JsonValue::Array(transforms.iter().map(encode_field_transform).collect()),
            );
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": encode_timestamp(&version.timestamp()) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    fn encode_document(&self, key: &DocumentKey, value: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(value.fields()),
        })
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(token) => BytesValue::from_base64(token)
                .map_err(|err| invalid_argument(format!("Invalid streamToken: {err}")))?,
            None => BytesValue::default(),
        };
        let commit_version = self.decode_version(value.get("commitTime"))?;

        let mut write_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            for result in results {
                let mut version = self.decode_version(result.get("updateTime"))?;
                // Deletes of missing documents carry no update time.
                if version.is_min() {
                    version = commit_version;
                }
                let transform_results = result
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                write_results.push(MutationResult {
                    version,
                    transform_results,
                });
            }
        }

        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }
}

fn encode_field_transform(transform: &FieldTransform) -> JsonValue {
    let field_path = transform.field.canonical_string();
    match &transform.operation {
        TransformOperation::ServerTimestamp => json!({
            "fieldPath": field_path,
            "setToServerValue": "REQUEST_TIME",
        }),
        TransformOperation::ArrayUnion(elements) => json!({
            "fieldPath": field_path,
            "appendMissingElements": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() },
        }),
        TransformOperation::ArrayRemove(elements) => json!({
            "fieldPath": field_path,
            "removeAllFromArray": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() },
        }),
        TransformOperation::NumericIncrement(operand) => json!({
            "fieldPath": field_path,
            "increment": encode_value(operand),
        }),
    }
}

fn encode_map_fields(fields: &BTreeMap<String, FirestoreValue>) -> JsonValue {
    let mut encoded = serde_json::Map::new();
    for (key, value) in fields {
        encoded.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(encoded)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) if double.is_nan() => json!({ "doubleValue": "NaN" }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::ServerTimestamp(placeholder) => {
            log::warn!(target: LOG_TARGET, "encoding a pending server timestamp as its local estimate");
            json!({ "timestampValue": encode_timestamp(&placeholder.local_write_time) })
        }
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map.fields())
            }
        }),
        ValueKind::Sentinel(_) => {
            log::warn!(target: LOG_TARGET, "sentinel reached the wire encoder; sending null");
            json!({ "nullValue": JsonValue::Null })
        }
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
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
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        return Ok(FirestoreValue::from_map(map.fields().clone()));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{FieldMask, FieldPath};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    #[test]
    fn document_names_round_trip() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let name = serializer.document_name(&key);
        assert_eq!(name, "projects/p/databases/(default)/documents/rooms/eros");
        assert_eq!(serializer.document_key_from_name(&name).unwrap(), key);
        assert!(serializer
            .document_key_from_name("projects/other/databases/(default)/documents/rooms/eros")
            .is_err());
    }

    #[test]
    fn encodes_resume_token_with_expected_count() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(BytesValue::from(vec![1u8, 2]), SnapshotVersion::new(Timestamp::new(5, 0)))
            .with_expected_count(3);
        let request = serializer().encode_listen_request(&data);
        let add = &request["addTarget"];
        assert_eq!(add["targetId"], json!(2));
        assert_eq!(add["resumeToken"], json!("AQI="));
        assert_eq!(add["expectedCount"], json!(3));
        assert!(add.get("readTime").is_none());
        assert_eq!(add["query"]["parent"], json!("projects/p/databases/(default)/documents"));
        assert_eq!(
            add["query"]["structuredQuery"]["from"][0]["collectionId"],
            json!("rooms")
        );
    }

    #[test]
    fn falls_back_to_read_time_and_skips_count_without_resume_point() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let fresh = TargetData::new(Target::for_document(&key), 3, TargetPurpose::LimboResolution, 1)
            .with_expected_count(1);
        let encoded = serializer().encode_target(&fresh);
        assert!(encoded.get("expectedCount").is_none());
        assert_eq!(
            encoded["documents"]["documents"][0],
            json!("projects/p/databases/(default)/documents/rooms/a")
        );

        let mut resumed = fresh.clone();
        resumed.snapshot_version = SnapshotVersion::new(Timestamp::new(10, 0));
        let encoded = serializer().encode_target(&resumed);
        assert_eq!(encoded["readTime"], json!("1970-01-01T00:00:10.000000000Z"));
        assert_eq!(encoded["expectedCount"], json!(1));
    }

    #[test]
    fn encodes_patch_with_mask_and_precondition() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let field = FieldPath::from_dot_separated("name").unwrap();
        let mut data = ObjectValue::empty();
        data.set(&field, FirestoreValue::from_string("x"));
        let mutation = Mutation::patch(key, data, FieldMask::new([field]), Precondition::Exists(true));
        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["name"]));
        assert_eq!(encoded["currentDocument"]["exists"], json!(true));
        assert_eq!(encoded["update"]["fields"]["name"]["stringValue"], json!("x"));
    }

    #[test]
    fn decodes_write_response_defaulting_versions_to_commit_time() {
        let response = serializer()
            .decode_write_response(&json!({
                "streamToken": "AQ==",
                "commitTime": "1970-01-01T00:00:07Z",
                "writeResults": [
                    { "updateTime": "1970-01-01T00:00:06Z" },
                    { "transformResults": [{ "integerValue": "4" }] }
                ]
            }))
            .unwrap();
        assert_eq!(response.stream_token, BytesValue::from(vec![1u8]));
        assert_eq!(response.write_results[0].version, SnapshotVersion::new(Timestamp::new(6, 0)));
        assert_eq!(response.write_results[1].version, response.commit_version);
        assert_eq!(
            response.write_results[1].transform_results,
            vec![FirestoreValue::from_integer(4)]
        );
    }

    #[test]
    fn decodes_documents_with_versions() {
        let document = serializer()
            .decode_document(&json!({
                "name": "projects/p/databases/(default)/documents/rooms/a",
                "fields": { "n": { "integerValue": "1" } },
                "updateTime": "1970-01-01T00:00:03Z"
            }))
            .unwrap();
        assert!(document.is_found_document());
        assert_eq!(document.version(), SnapshotVersion::new(Timestamp::new(3, 0)));
    }
}
