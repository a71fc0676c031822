use std::collections::BTreeSet;

use crate::firestore::model::{DocumentKey, DocumentKeySet};

/// Key <-> id references, indexed both ways.
///
/// The id is a target id for view and limbo references and a batch id for
/// mutation queue references.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(id).into_iter().collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .map(|(candidate, _)| candidate == key)
            .unwrap_or(false)
    }

    /// Ids referencing `key`, in ascending order.
    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .take_while(|(candidate, _)| candidate == key)
            .map(|(_, id)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_both_ways() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("c/a"), 1);
        set.add_reference(key("c/b"), 1);
        set.add_reference(key("c/a"), 2);

        assert!(set.contains_key(&key("c/a")));
        assert_eq!(set.references_for_id(1).len(), 2);
        assert_eq!(set.ids_for_key(&key("c/a")), vec![1, 2]);

        let removed = set.remove_references_for_id(1);
        assert_eq!(removed.len(), 2);
        assert!(set.contains_key(&key("c/a")));
        assert!(!set.contains_key(&key("c/b")));
    }

    #[test]
    fn remove_all_empties_the_set() {
        let mut set = ReferenceSet::new();
        set.add_references([key("c/a"), key("c/b")].iter(), 7);
        set.remove_all_references();
        assert!(set.is_empty());
    }
}
