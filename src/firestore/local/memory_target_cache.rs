use std::collections::HashMap;

use crate::firestore::core::{ListenSequenceNumber, Target, TargetId, TargetIdGenerator};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::TargetCache;
use crate::firestore::local::{ReferenceSet, TargetData};
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};

/// Targets keyed by canonical id, with the server-reported matching keys of
/// each target.
#[derive(Debug)]
pub struct MemoryTargetCache {
    targets: HashMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    matching_keys: ReferenceSet,
    target_id_generator: TargetIdGenerator,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            matching_keys: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(0),
        }
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::for_target_cache(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets
            .insert(target_data.target.canonical_id(), target_data);
    }
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCache for MemoryTargetCache {
    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn allocate_target_id(&mut self) -> TargetId {
        self.highest_target_id = self.target_id_generator.next();
        self.highest_target_id
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        let canonical_id = target_data.target.canonical_id();
        if self.targets.contains_key(&canonical_id) {
            return Err(internal_error(format!(
                "Adding a target that already exists: {canonical_id}"
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        let canonical_id = target_data.target.canonical_id();
        if !self.targets.contains_key(&canonical_id) {
            return Err(internal_error(format!(
                "Updating a nonexistent target: {canonical_id}"
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_data: &TargetData) {
        self.targets.remove(&target_data.target.canonical_id());
        self.matching_keys
            .remove_references_for_id(target_data.target_id);
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(&target.canonical_id()).cloned()
    }

    fn get_target_data_for_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets
            .values()
            .find(|target_data| target_data.target_id == target_id)
            .cloned()
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn target_sequence_numbers(&self) -> Vec<(TargetId, ListenSequenceNumber)> {
        self.targets
            .values()
            .map(|target_data| (target_data.target_id, target_data.sequence_number))
            .collect()
    }

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.matching_keys.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.matching_keys.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> Vec<DocumentKey> {
        self.matching_keys.remove_references_for_id(target_id)
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.matching_keys.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::ResourcePath;

    fn target(path: &str) -> Target {
        Query::new(ResourcePath::from_string(path).unwrap()).to_target()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn allocates_even_ids_above_highest_seen() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id(), 2);
        cache
            .add_target_data(TargetData::new(target("rooms"), 10, TargetPurpose::Listen, 7))
            .unwrap();
        assert_eq!(cache.allocate_target_id(), 12);
        assert_eq!(cache.highest_sequence_number(), 7);
    }

    #[test]
    fn add_and_update_guard_existence() {
        let mut cache = MemoryTargetCache::new();
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
        assert!(cache.update_target_data(data.clone()).is_err());
        cache.add_target_data(data.clone()).unwrap();
        assert!(cache.add_target_data(data.clone()).is_err());
        cache.update_target_data(data.with_sequence_number(5)).unwrap();
        assert_eq!(cache.get_target_data(&target("rooms")).unwrap().sequence_number, 5);
        assert_eq!(cache.get_target_data_for_id(2).unwrap().target, target("rooms"));
        assert_eq!(cache.target_count(), 1);
    }

    #[test]
    fn removing_a_target_drops_its_matching_keys() {
        let mut cache = MemoryTargetCache::new();
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
        cache.add_target_data(data.clone()).unwrap();
        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.add_matching_keys(&keys, 2);
        assert!(cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.get_matching_keys_for_target_id(2).len(), 2);

        cache.remove_target_data(&data);
        assert!(!cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.target_count(), 0);
    }

    #[test]
    fn filtered_ordered_limited_target_is_found_again_by_an_equal_query() {
        use crate::firestore::core::{Direction, FieldFilter, FilterOperator, LimitType, OrderBy};
        use crate::firestore::test_support::{doc, field, query, version};
        use crate::firestore::value::{BytesValue, FirestoreValue};

        let build = || {
            query("rooms")
                .with_filter(
                    FieldFilter::new(field("rank"), FilterOperator::GreaterThanOrEqual, FirestoreValue::from_integer(2))
                        .unwrap(),
                )
                .with_order_by(OrderBy::new(field("rank"), Direction::Descending))
                .unwrap()
                .with_limit(2, LimitType::First)
                .unwrap()
        };
        let original = build();
        let resume_token = BytesValue::from_base64("AQID").unwrap();
        let data = TargetData::new(original.to_target(), 4, TargetPurpose::Listen, 3)
            .with_resume_token(resume_token.clone(), version(5));

        let mut cache = MemoryTargetCache::new();
        cache.add_target_data(data.clone()).unwrap();

        let stored = cache.get_target_data(&build().to_target()).unwrap();
        assert_eq!(stored, data);
        assert_eq!(stored.target, original.to_target());
        assert_eq!(stored.resume_token, resume_token);
        assert_eq!(stored.snapshot_version, version(5));
        assert_eq!(stored.target.limit, Some(2));

        for document in [
            doc("rooms/a", 1, &[("rank", 1)]),
            doc("rooms/b", 1, &[("rank", 2)]),
            doc("rooms/c", 1, &[("rank", 3)]),
        ] {
            let stored_matches = stored.target.filters.iter().all(|filter| filter.matches(&document));
            assert_eq!(stored_matches, original.matches(&document), "{}", document.key());
        }

        let wider = build().with_limit(3, LimitType::First).unwrap();
        assert!(cache.get_target_data(&wider.to_target()).is_none());
    }
}
