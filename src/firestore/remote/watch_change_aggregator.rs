use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{ChangeType, TargetId};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::firestore::value::BytesValue;

const LOG_TARGET: &str = "firestore::watch_change_aggregator";

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently maps to the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data of an active listen, or `None` when the target is not
    /// listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

/// Outcome of checking an existence filter's bloom filter against local keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding watch/unwatch requests. Changes for a pending target are
    /// dropped.
    pending_responses: usize,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: BytesValue,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: BytesValue::default(),
            current: false,
            // Raise a first event even if nothing but the ack arrives.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &BytesValue) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified | ChangeType::Metadata => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch changes into [`RemoteEvent`]s at consistent
/// snapshot boundaries.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MutableDocumentMap,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Every target a pending document was added to or removed from.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        let found = change.new_doc.as_ref().filter(|doc| doc.is_found_document());
        for target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(provider, *target_id, document.clone()),
                None => self.remove_document_from_target(provider, *target_id, &change.key, change.new_doc.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &change.key, change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.targets_for_change(provider, change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A target that was added and removed again may
                        // still have changes from the first listen.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn targets_for_change(&self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect()
    }

    /// Compares the server's document count for a target with the local
    /// count. A mismatch the bloom filter cannot explain resets the target.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted while the client was not listening.
                let path = target_data.target.path.clone();
                let Ok(key) = DocumentKey::from_path(path) else {
                    return;
                };
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(provider, target_id, &key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!(
                    target: LOG_TARGET,
                    "single document existence filter with count {expected_count} for target {target_id}"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == i64::from(expected_count) {
            return;
        }

        let status = match self.parse_bloom_filter(change) {
            Some(filter) => self.apply_bloom_filter(provider, &filter, change, current_count),
            None => BloomFilterApplicationStatus::Skipped,
        };
        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(provider, target_id);
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                target: LOG_TARGET,
                "existence filter mismatch for target {target_id} (local {current_count}, server {expected_count}, bloom {status:?}); resetting"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let payload = change.existence_filter.unchanged_names.as_ref()?;
        match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
            Ok(filter) if filter.bit_count() == 0 => None,
            Ok(filter) => Some(filter),
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "applying bloom filter failed: ({err}); ignoring the bloom filter and falling back to full re-query"
                );
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplicationStatus {
        let removed = self.filter_removed_documents(provider, filter, change.target_id);
        if i64::from(change.existence_filter.count) == current_count - removed {
            BloomFilterApplicationStatus::Success
        } else {
            BloomFilterApplicationStatus::FalsePositive
        }
    }

    /// Removes every locally known key the bloom filter rules out and returns
    /// how many were removed.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let database_name = provider.database_id().database_name();
        let mut removed = 0;
        for key in provider.remote_keys_for_target(target_id) {
            let name = format!("{database_name}/documents/{}", key.path().canonical_string());
            if !filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and clears the
    /// pending state.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self.target_states.get(&target_id).is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target that never saw its document
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated_for_target = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated_for_target && !self.target_contains_document(provider, target_id, &key) {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        };
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();
        event
    }

    fn add_document_to_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = self.target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before any snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    /// Called for every watch or unwatch request sent for the target.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let active = self.target_data_for_active_target(provider, target_id).is_some();
        if !active {
            log::debug!(target: LOG_TARGET, "detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target<'p>(
        &self,
        provider: &'p dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<&'p TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            return None;
        }
        provider.target_data_for_target(target_id)
    }

    /// Starts the target over and removes every key it currently maps to, so
    /// documents watch does not resend are dropped.
    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }

    fn target_contains_document(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
        provider.remote_keys_for_target(target_id).contains(key)
    }
}
