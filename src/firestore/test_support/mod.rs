//! Builders shared by the unit tests.

use std::sync::Arc;

use crate::firestore::api::Firestore;
use crate::firestore::core::Query;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, Mutation, ObjectValue, ResourcePath, SnapshotVersion,
    Timestamp,
};
use crate::firestore::remote::{EmptyCredentialsProvider, InMemoryConnection};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::FirestoreValue;

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).unwrap()
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Object with integer fields, e.g. `object(&[("rank", 1)])`.
pub fn object(fields: &[(&str, i64)]) -> ObjectValue {
    let mut data = ObjectValue::empty();
    for (name, value) in fields {
        data.set(&field(name), FirestoreValue::from_integer(*value));
    }
    data
}

pub fn doc(path: &str, seconds: i64, fields: &[(&str, i64)]) -> MutableDocument {
    MutableDocument::new_found(key(path), version(seconds), object(fields))
}

pub fn deleted_doc(path: &str, seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(path), version(seconds))
}

pub fn query(collection: &str) -> Query {
    Query::new(path(collection))
}

pub fn set_mutation(path: &str, fields: &[(&str, i64)]) -> Mutation {
    Mutation::set(key(path), object(fields))
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

/// Client for project `p` whose backend is played through the returned
/// connection.
pub fn test_firestore() -> (Firestore, Arc<InMemoryConnection>) {
    let connection = InMemoryConnection::new();
    let firestore = Firestore::new(
        DatabaseId::new("p", "(default)"),
        FirestoreSettings::default(),
        connection.clone(),
        Arc::new(EmptyCredentialsProvider),
    );
    (firestore, connection)
}
