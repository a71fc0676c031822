use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::firestore::core::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::lru_garbage_collector::LruDelegate;
use crate::firestore::local::persistence::PersistenceCaches;
use crate::firestore::local::TargetData;
use crate::firestore::model::DocumentKey;

const LOG_TARGET: &str = "firestore::persistence";

/// Keeps cached documents alive while something references them and decides
/// when unreferenced documents leave the remote document cache.
pub trait ReferenceDelegate: Send {
    fn on_transaction_started(&mut self, sequence_number: ListenSequenceNumber);

    fn on_transaction_committed(&mut self, caches: &mut PersistenceCaches<'_>) -> FirestoreResult<()>;

    fn add_reference(&mut self, caches: &mut PersistenceCaches<'_>, target_id: TargetId, key: &DocumentKey);

    fn remove_reference(&mut self, caches: &mut PersistenceCaches<'_>, target_id: TargetId, key: &DocumentKey);

    /// Drops the target and releases the documents it held.
    fn remove_target(&mut self, caches: &mut PersistenceCaches<'_>, target_data: &TargetData) -> FirestoreResult<()>;

    fn mark_potentially_orphaned(&mut self, caches: &mut PersistenceCaches<'_>, key: &DocumentKey);

    /// Called when a mutation batch touching `key` leaves the queue.
    fn remove_mutation_reference(&mut self, caches: &mut PersistenceCaches<'_>, key: &DocumentKey);

    /// Called when a limbo document is updated outside of any target.
    fn update_limbo_document(&mut self, caches: &mut PersistenceCaches<'_>, key: &DocumentKey);

    fn lru_delegate(&mut self) -> Option<&mut dyn LruDelegate> {
        None
    }
}

fn is_referenced(caches: &PersistenceCaches<'_>, key: &DocumentKey) -> bool {
    caches.target_cache.contains_key(key)
        || caches.local_view_references.contains_key(key)
        || caches.mutation_queue.contains_key(key)
}

/// Removes documents from the cache as soon as the last reference goes away.
#[derive(Debug, Default)]
pub struct MemoryEagerDelegate {
    orphaned_documents: BTreeSet<DocumentKey>,
}

impl MemoryEagerDelegate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn on_transaction_started(&mut self, _sequence_number: ListenSequenceNumber) {
        self.orphaned_documents.clear();
    }

    fn on_transaction_committed(&mut self, caches: &mut PersistenceCaches<'_>) -> FirestoreResult<()> {
        let orphaned = std::mem::take(&mut self.orphaned_documents);
        for key in orphaned {
            if !is_referenced(caches, &key) {
                log::trace!(target: LOG_TARGET, "collecting unreferenced document {key}");
                caches.remote_documents.remove_entry(&key);
            }
        }
        Ok(())
    }

    fn add_reference(&mut self, _caches: &mut PersistenceCaches<'_>, _target_id: TargetId, key: &DocumentKey) {
        self.orphaned_documents.remove(key);
    }

    fn remove_reference(&mut self, _caches: &mut PersistenceCaches<'_>, _target_id: TargetId, key: &DocumentKey) {
        self.orphaned_documents.insert(key.clone());
    }

    fn remove_target(&mut self, caches: &mut PersistenceCaches<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        let keys = caches
            .target_cache
            .remove_matching_keys_for_target_id(target_data.target_id);
        self.orphaned_documents.extend(keys);
        caches.target_cache.remove_target_data(target_data);
        Ok(())
    }

    fn mark_potentially_orphaned(&mut self, _caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        self.orphaned_documents.insert(key.clone());
    }

    fn remove_mutation_reference(&mut self, _caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        self.orphaned_documents.insert(key.clone());
    }

    fn update_limbo_document(&mut self, caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        if is_referenced(caches, key) {
            self.orphaned_documents.remove(key);
        } else {
            self.orphaned_documents.insert(key.clone());
        }
    }
}

/// Tags every released document with the sequence number of the transaction
/// that released it; collection happens later in bulk.
#[derive(Debug, Default)]
pub struct MemoryLruDelegate {
    orphaned_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
    current_sequence_number: ListenSequenceNumber,
}

impl MemoryLruDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, key: &DocumentKey) {
        self.orphaned_sequence_numbers
            .insert(key.clone(), self.current_sequence_number);
    }

    fn is_pinned(
        &self,
        caches: &PersistenceCaches<'_>,
        key: &DocumentKey,
        upper_bound: ListenSequenceNumber,
    ) -> bool {
        if is_referenced(caches, key) {
            return true;
        }
        self.orphaned_sequence_numbers
            .get(key)
            .is_some_and(|sequence_number| *sequence_number > upper_bound)
    }
}

impl ReferenceDelegate for MemoryLruDelegate {
    fn on_transaction_started(&mut self, sequence_number: ListenSequenceNumber) {
        self.current_sequence_number = sequence_number;
    }

    fn on_transaction_committed(&mut self, _caches: &mut PersistenceCaches<'_>) -> FirestoreResult<()> {
        Ok(())
    }

    fn add_reference(&mut self, _caches: &mut PersistenceCaches<'_>, _target_id: TargetId, key: &DocumentKey) {
        self.touch(key);
    }

    fn remove_reference(&mut self, _caches: &mut PersistenceCaches<'_>, _target_id: TargetId, key: &DocumentKey) {
        self.touch(key);
    }

    fn remove_target(&mut self, caches: &mut PersistenceCaches<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        let updated = target_data.with_sequence_number(self.current_sequence_number);
        caches.target_cache.update_target_data(updated)
    }

    fn mark_potentially_orphaned(&mut self, _caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        self.touch(key);
    }

    fn remove_mutation_reference(&mut self, _caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        self.touch(key);
    }

    fn update_limbo_document(&mut self, _caches: &mut PersistenceCaches<'_>, key: &DocumentKey) {
        self.touch(key);
    }

    fn lru_delegate(&mut self) -> Option<&mut dyn LruDelegate> {
        Some(self)
    }
}

impl LruDelegate for MemoryLruDelegate {
    fn sequence_number_count(&self, caches: &PersistenceCaches<'_>) -> usize {
        caches.target_cache.target_count() + self.orphaned_sequence_numbers.len()
    }

    fn sequence_numbers(&self, caches: &PersistenceCaches<'_>) -> Vec<ListenSequenceNumber> {
        caches
            .target_cache
            .target_sequence_numbers()
            .into_iter()
            .map(|(_, sequence_number)| sequence_number)
            .chain(self.orphaned_sequence_numbers.values().copied())
            .collect()
    }

    fn remove_targets(
        &mut self,
        caches: &mut PersistenceCaches<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> usize {
        let mut removed = 0;
        for (target_id, sequence_number) in caches.target_cache.target_sequence_numbers() {
            if sequence_number > upper_bound || active_target_ids.contains(&target_id) {
                continue;
            }
            if let Some(target_data) = caches.target_cache.get_target_data_for_id(target_id) {
                for key in caches.target_cache.remove_matching_keys_for_target_id(target_id) {
                    self.touch(&key);
                }
                caches.target_cache.remove_target_data(&target_data);
                removed += 1;
            }
        }
        removed
    }

    fn remove_orphaned_documents(
        &mut self,
        caches: &mut PersistenceCaches<'_>,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        let mut removed = 0;
        for key in caches.remote_documents.keys() {
            if !self.is_pinned(caches, &key, upper_bound) {
                caches.remote_documents.remove_entry(&key);
                self.orphaned_sequence_numbers.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn cache_size(&self, caches: &PersistenceCaches<'_>) -> usize {
        caches.remote_documents.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::MemoryPersistence;
    use crate::firestore::model::{MutableDocument, ObjectValue, SnapshotVersion, Timestamp};
    use crate::firestore::settings::FirestoreSettings;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn cache_document(persistence: &mut MemoryPersistence, path: &str) {
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        persistence
            .run_transaction("cache", |txn| {
                let document = MutableDocument::new_found(key(path), version, ObjectValue::empty());
                txn.caches.remote_documents.add_entry(document, version)
            })
            .unwrap();
    }

    #[test]
    fn eager_delegate_drops_released_documents() {
        let mut persistence = MemoryPersistence::new(&FirestoreSettings::default());
        cache_document(&mut persistence, "rooms/a");
        persistence
            .run_transaction("pin", |txn| {
                txn.caches.local_view_references.add_reference(key("rooms/a"), 2);
                txn.reference_delegate.add_reference(&mut txn.caches, 2, &key("rooms/a"));
                Ok(())
            })
            .unwrap();
        persistence
            .run_transaction("release", |txn| {
                txn.caches.local_view_references.remove_reference(&key("rooms/a"), 2);
                txn.reference_delegate.remove_reference(&mut txn.caches, 2, &key("rooms/a"));
                Ok(())
            })
            .unwrap();
        let cached = persistence
            .run_transaction("read", |txn| {
                Ok(txn.caches.remote_documents.get_entry(&key("rooms/a")))
            })
            .unwrap();
        assert!(!cached.is_valid_document());
    }

    #[test]
    fn eager_delegate_keeps_referenced_documents() {
        let mut persistence = MemoryPersistence::new(&FirestoreSettings::default());
        cache_document(&mut persistence, "rooms/a");
        persistence
            .run_transaction("orphan", |txn| {
                txn.caches
                    .target_cache
                    .add_matching_keys(&[key("rooms/a")].into_iter().collect(), 2);
                txn.reference_delegate
                    .mark_potentially_orphaned(&mut txn.caches, &key("rooms/a"));
                Ok(())
            })
            .unwrap();
        let cached = persistence
            .run_transaction("read", |txn| {
                Ok(txn.caches.remote_documents.get_entry(&key("rooms/a")))
            })
            .unwrap();
        assert!(cached.is_found_document());
    }

    #[test]
    fn lru_delegate_keeps_documents_until_collected() {
        let settings = FirestoreSettings::default().with_lru_cache_size(1024 * 1024);
        let mut persistence = MemoryPersistence::new(&settings);
        cache_document(&mut persistence, "rooms/a");
        persistence
            .run_transaction("orphan", |txn| {
                txn.reference_delegate
                    .mark_potentially_orphaned(&mut txn.caches, &key("rooms/a"));
                Ok(())
            })
            .unwrap();
        let removed = persistence
            .run_transaction("collect", |txn| {
                assert!(txn.caches.remote_documents.get_entry(&key("rooms/a")).is_found_document());
                let lru = txn.reference_delegate.lru_delegate().unwrap();
                Ok(lru.remove_orphaned_documents(&mut txn.caches, 2))
            })
            .unwrap();
        assert_eq!(removed, 1);
    }
}
