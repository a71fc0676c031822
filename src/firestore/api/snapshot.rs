use std::collections::BTreeMap;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument};
use crate::firestore::value::{FirestoreValue, ValueKind};

use super::reference::DocumentReference;
use super::Firestore;

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// True when the data may be stale because the backend has not confirmed it.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// True when the snapshot contains local writes the backend has not
    /// acknowledged yet.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

/// How server timestamps that have not been written yet are surfaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerTimestampBehavior {
    /// Pending server timestamps read as `null`.
    #[default]
    None,
    /// Pending server timestamps read as the local write time.
    Estimate,
    /// Pending server timestamps read as the field's previous value.
    Previous,
}

#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    firestore: Firestore,
    key: DocumentKey,
    document: Option<MutableDocument>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(
        firestore: Firestore,
        key: DocumentKey,
        document: Option<MutableDocument>,
        metadata: SnapshotMetadata,
    ) -> Self {
        let document = document.filter(MutableDocument::is_found_document);
        Self {
            firestore,
            key,
            document,
            metadata,
        }
    }

    /// Returns whether the document exists.
    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    /// Returns the document fields with pending server timestamps read as `null`.
    pub fn data(&self) -> Option<BTreeMap<String, FirestoreValue>> {
        self.data_with(ServerTimestampBehavior::None)
    }

    pub fn data_with(&self, behavior: ServerTimestampBehavior) -> Option<BTreeMap<String, FirestoreValue>> {
        self.document.as_ref().map(|document| {
            document
                .data()
                .fields()
                .iter()
                .map(|(name, value)| (name.clone(), resolve_server_timestamps(value, behavior)))
                .collect()
        })
    }

    /// Reads one field by dot-separated path.
    pub fn get(&self, field: &str) -> FirestoreResult<Option<FirestoreValue>> {
        self.get_with(field, ServerTimestampBehavior::None)
    }

    pub fn get_with(&self, field: &str, behavior: ServerTimestampBehavior) -> FirestoreResult<Option<FirestoreValue>> {
        let path = FieldPath::from_dot_separated(field)?;
        Ok(self
            .document
            .as_ref()
            .and_then(|document| document.field(&path))
            .map(|value| resolve_server_timestamps(value, behavior)))
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn reference(&self) -> DocumentReference {
        DocumentReference::from_key(self.firestore.clone(), self.key.clone())
    }
}

fn resolve_server_timestamps(value: &FirestoreValue, behavior: ServerTimestampBehavior) -> FirestoreValue {
    match value.kind() {
        ValueKind::ServerTimestamp(placeholder) => match behavior {
            ServerTimestampBehavior::None => FirestoreValue::null(),
            ServerTimestampBehavior::Estimate => FirestoreValue::from_timestamp(placeholder.local_write_time),
            ServerTimestampBehavior::Previous => placeholder
                .previous_value
                .as_deref()
                .map(|previous| resolve_server_timestamps(previous, behavior))
                .unwrap_or_else(FirestoreValue::null),
        },
        ValueKind::Map(map) => FirestoreValue::from_map(
            map.fields()
                .iter()
                .map(|(name, value)| (name.clone(), resolve_server_timestamps(value, behavior)))
                .collect(),
        ),
        ValueKind::Array(array) => FirestoreValue::from_array(
            array
                .values()
                .iter()
                .map(|value| resolve_server_timestamps(value, behavior))
                .collect(),
        ),
        _ => value.clone(),
    }
}
