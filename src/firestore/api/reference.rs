use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::fmt::{Display, Formatter};

use crate::firestore::core::Query as CoreQuery;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};

use super::database::Firestore;
use super::query::Query;

const AUTO_ID_LENGTH: usize = 20;

#[derive(Clone, Debug)]
pub struct CollectionReference {
    firestore: Firestore,
    path: ResourcePath,
}

impl CollectionReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection reference. Collection references must have an odd number of segments, \
                 but {} has {}.",
                path.canonical_string(),
                path.len()
            )));
        }
        Ok(Self { firestore, path })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The full resource path of the collection (e.g. `rooms/eros/messages`).
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// Returns the document that logically contains this collection, if any.
    pub fn parent(&self) -> Option<DocumentReference> {
        let parent_path = self.path.without_last();
        if parent_path.is_empty() {
            return None;
        }
        DocumentKey::from_path(parent_path)
            .ok()
            .map(|key| DocumentReference::from_key(self.firestore.clone(), key))
    }

    /// Returns a reference to the document identified by `document_id`.
    ///
    /// When `document_id` is `None`, an auto-ID is generated.
    pub fn doc(&self, document_id: Option<&str>) -> FirestoreResult<DocumentReference> {
        let id = document_id
            .map(|id| id.to_string())
            .unwrap_or_else(generate_auto_id);
        if id.is_empty() {
            return Err(invalid_argument("Document ID must be a non-empty string."));
        }
        let path = self.path.child(ResourcePath::from_string(&id)?.iter().cloned());
        DocumentReference::new(self.firestore.clone(), path)
    }

    /// Creates a query that targets this collection.
    pub fn query(&self) -> Query {
        Query::new(self.firestore.clone(), CoreQuery::new(self.path.clone()))
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionReference({})", self.path.canonical_string())
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReference {
    firestore: Firestore,
    key: DocumentKey,
}

impl DocumentReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        let key = DocumentKey::from_path(path)?;
        Ok(Self { firestore, key })
    }

    pub(crate) fn from_key(firestore: Firestore, key: DocumentKey) -> Self {
        Self { firestore, key }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn path(&self) -> &ResourcePath {
        self.key.path()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The parent collection containing this document.
    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            firestore: self.firestore.clone(),
            path: self.key.collection_path(),
        }
    }

    /// Returns a reference to a subcollection rooted at this document.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let sub_path = ResourcePath::from_string(path)?;
        let full_path = self.key.path().child(sub_path.iter().cloned());
        CollectionReference::new(self.firestore.clone(), full_path)
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentReference({})", self.key.path().canonical_string())
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::test_support::test_firestore;

    #[tokio::test]
    async fn collection_and_document_roundtrip() {
        let (firestore, _connection) = test_firestore();
        let collection = firestore.collection("cities").unwrap();
        assert_eq!(collection.id(), "cities");
        assert!(collection.parent().is_none());
        let document = collection.doc(Some("sf")).unwrap();
        assert_eq!(document.id(), "sf");
        assert_eq!(document.parent().id(), "cities");

        let nested = document.collection("landmarks").unwrap();
        assert_eq!(nested.path().canonical_string(), "cities/sf/landmarks");
        assert_eq!(nested.parent().unwrap().id(), "sf");
    }

    #[tokio::test]
    async fn auto_id_generation() {
        let (firestore, _connection) = test_firestore();
        let collection = firestore.collection("cities").unwrap();
        let first = collection.doc(None).unwrap();
        let second = collection.doc(None).unwrap();
        assert_eq!(first.parent().id(), "cities");
        assert_eq!(first.id().len(), 20);
        assert!(first.id().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn malformed_paths_are_rejected() {
        let (firestore, _connection) = test_firestore();
        for result in [
            firestore.collection("cities/sf").map(|_| ()),
            firestore.doc("cities").map(|_| ()),
            firestore.doc("cities//sf").map(|_| ()),
            firestore.collection("").map(|_| ()),
        ] {
            assert_eq!(result.unwrap_err().code, FirestoreErrorCode::InvalidArgument);
        }
    }
}
