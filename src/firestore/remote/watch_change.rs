use serde_json::Value as JsonValue;

use crate::firestore::core::TargetId;
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::rpc_error::decode_status;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::BytesValue;

/// One decoded message of the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    TargetChange(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document was added to, updated in, deleted from or removed from targets.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// `None` when the document only left the targets (a `documentRemove`).
    pub new_doc: Option<MutableDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means "all targets".
    pub target_ids: Vec<TargetId>,
    pub resume_token: BytesValue,
    pub cause: Option<FirestoreError>,
}

/// Raw bloom filter parameters as sent by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterPayload {
    pub bitmap: BytesValue,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

/// Decodes one `ListenResponse`. Unknown payloads yield `None`.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(target_change).map(Some);
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
        return decode_filter(filter).map(Some);
    }
    Ok(None)
}

/// Global snapshot version carried by a listen response.
///
/// Only a target change that applies to all targets marks a consistent
/// snapshot; everything else yields `min`.
pub fn snapshot_version_from_listen_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !target_ids(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    serializer.decode_version(target_change.get("readTime"))
}

fn decode_target_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => BytesValue::from_base64(token)
            .map_err(|err| invalid_argument(format!("Invalid resumeToken: {err}")))?,
        None => BytesValue::default(),
    };
    let state = match value.get("targetChangeType").and_then(JsonValue::as_str) {
        Some("ADD") => WatchTargetChangeState::Added,
        Some("REMOVE") => WatchTargetChangeState::Removed,
        Some("CURRENT") => WatchTargetChangeState::Current,
        Some("RESET") => WatchTargetChangeState::Reset,
        Some("NO_CHANGE") | None => WatchTargetChangeState::NoChange,
        Some(other) => return Err(invalid_argument(format!("Unknown target change type: {other}"))),
    };

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: target_ids(value.get("targetIds")),
        resume_token,
        cause: value.get("cause").and_then(decode_status),
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let new_doc = serializer.decode_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: target_ids(value.get("targetIds")),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        key: new_doc.key().clone(),
        new_doc: Some(new_doc),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let version = serializer.decode_version(value.get("readTime"))?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        new_doc: Some(MutableDocument::new_no_document(key.clone(), version)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(decode_bloom_filter)
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn decode_bloom_filter(value: &JsonValue) -> FirestoreResult<BloomFilterPayload> {
    let bits = value.get("bits");
    let bitmap = match bits.and_then(|bits| bits.get("bitmap")).and_then(JsonValue::as_str) {
        Some(encoded) => BytesValue::from_base64(encoded)
            .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))?,
        None => BytesValue::default(),
    };
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let hash_count = value
        .get("hashCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    Ok(BloomFilterPayload {
        bitmap,
        padding,
        hash_count,
    })
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": "AQID",
                "targetChangeType": "CURRENT"
            }
        });

        match decode_watch_change(&serializer(), &change).unwrap().unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, BytesValue::from(vec![1u8, 2, 3]));
                assert_eq!(change.state, WatchTargetChangeState::Current);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "nope" }
            }
        });
        let WatchChange::TargetChange(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected a target change");
        };
        assert_eq!(change.cause.unwrap().code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn document_delete_becomes_versioned_no_document() {
        let change = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/a",
                "readTime": "1970-01-01T00:00:09Z",
                "removedTargetIds": [2]
            }
        });
        let WatchChange::Document(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected a document change");
        };
        let doc = change.new_doc.unwrap();
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), SnapshotVersion::new(Timestamp::new(9, 0)));
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_existence_filter_with_bloom_payload() {
        let change = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": { "bits": { "bitmap": "AQ==", "padding": 1 }, "hashCount": 2 }
            }
        });
        let WatchChange::ExistenceFilter(change) = decode_watch_change(&serializer(), &change).unwrap().unwrap() else {
            panic!("expected an existence filter");
        };
        assert_eq!(change.existence_filter.count, 3);
        assert_eq!(
            change.existence_filter.unchanged_names,
            Some(BloomFilterPayload {
                bitmap: BytesValue::from(vec![1u8]),
                padding: 1,
                hash_count: 2,
            })
        );
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } });
        let scoped = json!({ "targetChange": { "targetIds": [1], "readTime": "1970-01-01T00:00:05Z" } });
        assert_eq!(
            snapshot_version_from_listen_response(&serializer, &global).unwrap(),
            SnapshotVersion::new(Timestamp::new(5, 0))
        );
        assert!(snapshot_version_from_listen_response(&serializer, &scoped)
            .unwrap()
            .is_min());
    }
}
