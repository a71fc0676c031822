use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::persistence::{IndexOffset, RemoteDocumentCache};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion,
};

#[derive(Clone, Debug)]
struct CacheEntry {
    document: MutableDocument,
    size: usize,
}

/// Remote documents held in a key-ordered map, with a running size estimate
/// used by the LRU collector.
#[derive(Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    entries: BTreeMap<DocumentKey, CacheEntry>,
    size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rough in-memory footprint of a document, used for cache size accounting.
pub(crate) fn document_size(document: &MutableDocument) -> usize {
    document.key().path().canonical_string().len()
        + document.data().to_value().canonical_id().len()
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, mut document: MutableDocument, read_time: SnapshotVersion) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(invalid_argument(
                "Cannot add a document with a read time of zero",
            ));
        }
        document.set_read_time(read_time);
        let size = document_size(&document);
        let key = document.key().clone();
        if let Some(previous) = self.entries.insert(key, CacheEntry { document, size }) {
            self.size -= previous.size;
        }
        self.size += size;
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        if let Some(previous) = self.entries.remove(key) {
            self.size -= previous.size;
        }
    }

    fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.entries
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    fn get_entries(&self, keys: &DocumentKeySet) -> MutableDocumentMap {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_docs: &DocumentKeySet,
    ) -> MutableDocumentMap {
        let in_scope = |key: &DocumentKey| match &query.collection_group {
            Some(group) => key.has_collection_id(group) && query.path.is_prefix_of(key.path()),
            None => query.path.is_immediate_parent_of(key.path()),
        };

        self.entries
            .iter()
            .filter(|(key, _)| in_scope(key))
            .filter(|(_, entry)| {
                IndexOffset::from_document(&entry.document).compare(offset) == Ordering::Greater
            })
            .filter(|(key, entry)| mutated_docs.contains(*key) || query.matches(&entry.document))
            .map(|(key, entry)| (key.clone(), entry.document.clone()))
            .collect()
    }

    fn keys(&self) -> Vec<DocumentKey> {
        self.entries.keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.size
    }
}
