use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents kept in query order, with key lookup.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    /// Ties are always broken by document key.
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &MutableDocument, right: &MutableDocument| {
            left.key().cmp(right.key())
        }))
    }

    /// Empty set with the same ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.by_key.remove(key) {
            if let Ok(index) = self.position(&existing) {
                self.sorted.remove(index);
            }
        }
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        let comparator = &self.comparator;
        self.sorted.binary_search_by(|probe| {
            comparator(probe, document).then_with(|| probe.key().cmp(document.key()))
        })
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted.len() == other.sorted.len()
            && self
                .sorted
                .iter()
                .zip(other.sorted.iter())
                .all(|(left, right)| left == right)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ObjectValue, SnapshotVersion, Timestamp};
    use crate::firestore::value::{compare_values, FirestoreValue};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn by_rank() -> DocumentComparator {
        let field = FieldPath::from_dot_separated("rank").unwrap();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            match (left.field(&field), right.field(&field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                _ => Ordering::Equal,
            }
        })
    }

    #[test]
    fn keeps_comparator_order_on_update() {
        let mut set = DocumentSet::new(by_rank());
        set.add(doc("c/a", 1));
        set.add(doc("c/b", 2));
        set.add(doc("c/c", 3));
        set.add(doc("c/c", 0));

        let keys: Vec<String> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["c/c", "c/a", "c/b"]);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/a").unwrap()), Some(1));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn delete_removes_from_both_indexes() {
        let mut set = DocumentSet::key_ordered();
        set.add(doc("c/a", 1));
        set.delete(&DocumentKey::from_string("c/a").unwrap());
        assert!(set.is_empty());
        assert!(!set.has(&DocumentKey::from_string("c/a").unwrap()));
    }
}
