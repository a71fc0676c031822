use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::firestore::core::{Query, Target, TargetId, User};
use crate::firestore::error::{internal_error, not_found, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransaction};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::{LocalViewChanges, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::BytesValue;

const LOG_TARGET: &str = "firestore::local_store";

/// Resume tokens older than this are persisted even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Outcome of a local write: the new batch and the documents it changed.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MutableDocumentMap,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: MutableDocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: DocumentKeySet,
}

/// Batches that appeared or disappeared when switching users, plus the
/// documents whose local view changed as a result.
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: MutableDocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Local source of truth: remote documents, pending writes and target
/// metadata, combined into local views.
pub struct LocalStore {
    persistence: MemoryPersistence,
    query_engine: QueryEngine,
    garbage_collector: Option<LruGarbageCollector>,
    /// Targets currently listened to, keyed by id.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
}

impl LocalStore {
    pub fn new(settings: &FirestoreSettings) -> Self {
        let garbage_collector = settings
            .lru_enabled()
            .then(|| LruGarbageCollector::new(settings.lru, settings.cache_size_bytes));
        Self {
            persistence: MemoryPersistence::new(settings),
            query_engine: QueryEngine::new(),
            garbage_collector,
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: HashMap::new(),
        }
    }

    pub fn user(&self) -> &User {
        self.persistence.user()
    }

    pub fn garbage_collector(&self) -> Option<&LruGarbageCollector> {
        self.garbage_collector.as_ref()
    }

    pub fn shutdown(&mut self) {
        self.persistence.shutdown();
    }

    /// Switches to the mutation queue of `user` and reports which batches
    /// went away or appeared.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.persistence.run_transaction("Get old batches", |txn| {
            Ok(txn.caches.mutation_queue.get_all_mutation_batches())
        })?;
        self.persistence.set_user(user);
        self.persistence.run_transaction("Handle user change", |txn| {
            let new_batches = txn.caches.mutation_queue.get_all_mutation_batches();
            let mut changed_keys = DocumentKeySet::new();
            let mut removed_batch_ids = Vec::new();
            let mut added_batch_ids = Vec::new();
            for batch in &old_batches {
                removed_batch_ids.push(batch.batch_id);
                changed_keys.extend(batch.keys());
            }
            for batch in &new_batches {
                added_batch_ids.push(batch.batch_id);
                changed_keys.extend(batch.keys());
            }
            let affected_documents =
                LocalDocumentsView::new(&mut txn.caches).get_documents(&changed_keys)?;
            Ok(UserChangeResult {
                affected_documents,
                removed_batch_ids,
                added_batch_ids,
            })
        })
    }

    /// Queues `mutations` as one batch and applies them to the local view.
    pub fn write_locally(
        &mut self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<LocalWriteResult> {
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();
        self.persistence.run_transaction("Locally write mutations", |txn| {
            let remote_documents = txn.caches.remote_documents.get_entries(&keys);
            let documents_without_remote_version: DocumentKeySet = remote_documents
                .iter()
                .filter(|(_, document)| !document.is_valid_document())
                .map(|(key, _)| key.clone())
                .collect();
            let mut overlayed =
                LocalDocumentsView::new(&mut txn.caches).get_overlayed_documents(remote_documents)?;

            // Transforms whose result depends on the current value (such as
            // increments) remember that value so a later remote update does
            // not change the outcome.
            let mut base_mutations = Vec::new();
            for mutation in &mutations {
                let Some(overlayed_document) = overlayed.get(mutation.key()) else {
                    continue;
                };
                if let Some(base_value) = mutation.extract_base_value(&overlayed_document.document) {
                    let mask = base_value.field_mask();
                    base_mutations.push(Mutation::patch(
                        mutation.key().clone(),
                        base_value,
                        mask,
                        Precondition::Exists(true),
                    ));
                }
            }

            let batch = txn.caches.mutation_queue.add_mutation_batch(
                local_write_time,
                base_mutations,
                mutations,
            )?;
            let overlays =
                batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
            txn.caches.overlays.save_overlays(batch.batch_id, overlays);
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: overlayed
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.document))
                    .collect(),
            })
        })
    }

    /// Applies a server acknowledgement and returns the affected documents.
    pub fn acknowledge_batch(
        &mut self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<MutableDocumentMap> {
        self.persistence.run_transaction("Acknowledge batch", |txn| {
            let batch = &batch_result.batch;
            txn.caches
                .mutation_queue
                .acknowledge_batch(batch, batch_result.stream_token.clone())?;
            apply_write_to_remote_documents(txn, batch_result)?;
            txn.caches.mutation_queue.perform_consistency_check()?;

            let affected_keys = batch.keys();
            txn.caches
                .overlays
                .remove_overlays_for_batch_id(&affected_keys, batch.batch_id);
            let mut view = LocalDocumentsView::new(&mut txn.caches);
            view.recalculate_and_save_overlays_for_document_keys(&keys_with_transform_results(
                batch_result,
            ))?;
            view.get_documents(&affected_keys)
        })
    }

    /// Drops a batch the backend refused and returns the affected documents.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<MutableDocumentMap> {
        self.persistence.run_transaction("Reject batch", |txn| {
            let batch = txn
                .caches
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .ok_or_else(|| not_found(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            remove_mutation_batch(txn, &batch)?;
            txn.caches.mutation_queue.perform_consistency_check()?;

            let affected_keys = batch.keys();
            txn.caches
                .overlays
                .remove_overlays_for_batch_id(&affected_keys, batch_id);
            let mut view = LocalDocumentsView::new(&mut txn.caches);
            view.recalculate_and_save_overlays_for_document_keys(&affected_keys)?;
            view.get_documents(&affected_keys)
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<BatchId> {
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", |txn| {
                Ok(txn.caches.mutation_queue.get_highest_unacknowledged_batch_id())
            })
    }

    /// First queued batch with an id greater than `after_batch_id`.
    pub fn next_mutation_batch(
        &mut self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", |txn| {
                Ok(txn
                    .caches
                    .mutation_queue
                    .get_next_mutation_batch_after_batch_id(after))
            })
    }

    pub fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", |txn| {
                Ok(txn.caches.target_cache.get_last_remote_snapshot_version())
            })
    }

    pub fn get_last_stream_token(&mut self) -> FirestoreResult<BytesValue> {
        self.persistence.run_transaction("Get last stream token", |txn| {
            Ok(txn.caches.mutation_queue.get_last_stream_token())
        })
    }

    pub fn set_last_stream_token(&mut self, stream_token: BytesValue) -> FirestoreResult<()> {
        self.persistence.run_transaction("Set last stream token", |txn| {
            txn.caches.mutation_queue.set_last_stream_token(stream_token);
            Ok(())
        })
    }

    /// Applies a consistent batch of watch changes to the remote document
    /// cache and target metadata. Returns the local views of the changed
    /// documents.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<MutableDocumentMap> {
        let remote_version = event.snapshot_version;
        let mut new_target_data = self.target_data_by_target.clone();
        let result = self.persistence.run_transaction("Apply remote event", |txn| {
            for (target_id, change) in &event.target_changes {
                let Some(old_target_data) = new_target_data.get(target_id).cloned() else {
                    continue;
                };
                txn.caches
                    .target_cache
                    .remove_matching_keys(&change.removed_documents, *target_id);
                for key in &change.removed_documents {
                    txn.reference_delegate
                        .remove_reference(&mut txn.caches, *target_id, key);
                }
                txn.caches
                    .target_cache
                    .add_matching_keys(&change.added_documents, *target_id);
                for key in &change.added_documents {
                    txn.reference_delegate
                        .add_reference(&mut txn.caches, *target_id, key);
                }

                let mut updated = old_target_data.with_sequence_number(txn.current_sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    updated = updated
                        .with_resume_token(BytesValue::default(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }
                if should_persist_target_data(&old_target_data, &updated, change) {
                    txn.caches.target_cache.update_target_data(updated.clone())?;
                }
                new_target_data.insert(*target_id, updated);
            }

            for key in &event.resolved_limbo_documents {
                if event.document_updates.contains_key(key) {
                    txn.reference_delegate
                        .update_limbo_document(&mut txn.caches, key);
                }
            }

            let (changed_documents, existence_changed) =
                populate_document_changes(txn, &event.document_updates)?;

            if !remote_version.is_min() {
                let last = txn.caches.target_cache.get_last_remote_snapshot_version();
                if remote_version < last {
                    return Err(internal_error(format!(
                        "Watch stream reverted to previous snapshot ({remote_version} < {last})"
                    )));
                }
                txn.caches
                    .target_cache
                    .set_last_remote_snapshot_version(remote_version);
            }

            LocalDocumentsView::new(&mut txn.caches)
                .get_local_view_of_documents(changed_documents, &existence_changed)
        })?;
        self.target_data_by_target = new_target_data;
        Ok(result)
    }

    /// Pins documents shown by views and advances the limbo-free snapshot of
    /// targets that were raised without cached data.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.persistence.run_transaction("Notify local view changes", |txn| {
            for view_change in view_changes {
                for key in &view_change.added_keys {
                    txn.caches
                        .local_view_references
                        .add_reference(key.clone(), view_change.target_id);
                    txn.reference_delegate
                        .add_reference(&mut txn.caches, view_change.target_id, key);
                }
                for key in &view_change.removed_keys {
                    txn.caches
                        .local_view_references
                        .remove_reference(key, view_change.target_id);
                    txn.reference_delegate
                        .remove_reference(&mut txn.caches, view_change.target_id, key);
                }
            }
            Ok(())
        })?;

        for view_change in view_changes {
            if view_change.from_cache {
                continue;
            }
            if let Some(target_data) = self.target_data_by_target.get_mut(&view_change.target_id) {
                let version = target_data.snapshot_version;
                *target_data = target_data.with_last_limbo_free_snapshot_version(version);
            }
        }
        Ok(())
    }

    /// Returns the cached target data for `target`, creating and persisting
    /// a new target when none exists.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let canonical_id = target.canonical_id();
        if let Some(target_data) = self
            .target_id_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| self.target_data_by_target.get(target_id))
        {
            return Ok(target_data.clone());
        }

        let target_data = self.persistence.run_transaction("Allocate target", |txn| {
            if let Some(cached) = txn.caches.target_cache.get_target_data(&target) {
                return Ok(cached);
            }
            let target_id = txn.caches.target_cache.allocate_target_id();
            let target_data = TargetData::new(
                target,
                target_id,
                TargetPurpose::Listen,
                txn.current_sequence_number,
            );
            txn.caches.target_cache.add_target_data(target_data.clone())?;
            Ok(target_data)
        })?;

        if !self.target_data_by_target.contains_key(&target_data.target_id) {
            self.target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            self.target_id_by_canonical_id
                .insert(canonical_id, target_data.target_id);
        }
        Ok(target_data)
    }

    pub fn get_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    /// Stops tracking the target. Unless `keep_persisted_target_data` is set
    /// the target is handed to the garbage collector.
    pub fn release_target(
        &mut self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.remove(&target_id) else {
            log::debug!(target: LOG_TARGET, "released unknown target {target_id}");
            return Ok(());
        };
        self.target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());

        self.persistence.run_transaction("Release target", |txn| {
            let pinned = txn
                .caches
                .local_view_references
                .remove_references_for_id(target_id);
            for key in &pinned {
                txn.reference_delegate
                    .mark_potentially_orphaned(&mut txn.caches, key);
            }
            if keep_persisted_target_data {
                return Ok(());
            }
            txn.reference_delegate
                .remove_target(&mut txn.caches, &target_data)
        })
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// target's limbo-free snapshot narrows the scan.
    pub fn execute_query(
        &mut self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let known = self
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
            .cloned();
        let query_engine = self.query_engine;
        self.persistence.run_transaction("Execute query", |txn| {
            let target_data = match known {
                Some(target_data) => Some(target_data),
                None => txn.caches.target_cache.get_target_data(&target),
            };
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    txn.caches
                        .target_cache
                        .get_matching_keys_for_target_id(target_data.target_id),
                ),
                None => (SnapshotVersion::min(), DocumentKeySet::new()),
            };
            let empty = DocumentKeySet::new();
            let mut view = LocalDocumentsView::new(&mut txn.caches);
            let documents = if use_previous_results {
                query_engine.get_documents_matching_query(&mut view, query, last_limbo_free, &remote_keys)?
            } else {
                query_engine.get_documents_matching_query(&mut view, query, SnapshotVersion::min(), &empty)?
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&mut self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.persistence.run_transaction("Remote document keys", |txn| {
            Ok(txn
                .caches
                .target_cache
                .get_matching_keys_for_target_id(target_id))
        })
    }

    /// Local view of one document.
    pub fn read_document(&mut self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.persistence.run_transaction("Read document", |txn| {
            Ok(LocalDocumentsView::new(&mut txn.caches).get_document(key))
        })
    }

    /// Runs LRU collection when it is enabled. Targets that are still
    /// listened to are never collected.
    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        let Some(collector) = self.garbage_collector.clone() else {
            return Ok(LruResults::default());
        };
        let active: HashSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        self.persistence.run_transaction("Collect garbage", |txn| {
            let Some(delegate) = txn.reference_delegate.lru_delegate() else {
                return Ok(LruResults::default());
            };
            Ok(collector.collect(delegate, &mut txn.caches, &active))
        })
    }
}

fn remove_mutation_batch(
    txn: &mut PersistenceTransaction<'_>,
    batch: &MutationBatch,
) -> FirestoreResult<()> {
    txn.caches.mutation_queue.remove_mutation_batch(batch)?;
    for key in batch.keys() {
        txn.reference_delegate
            .remove_mutation_reference(&mut txn.caches, &key);
    }
    Ok(())
}

fn apply_write_to_remote_documents(
    txn: &mut PersistenceTransaction<'_>,
    batch_result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let batch = &batch_result.batch;
    for key in batch.keys() {
        let mut document = txn.caches.remote_documents.get_entry(&key);
        let ack_version = batch_result
            .doc_versions
            .get(&key)
            .copied()
            .ok_or_else(|| internal_error(format!("no acknowledged version for {key}")))?;
        if document.version() < ack_version {
            batch.apply_to_remote_document(&mut document, batch_result)?;
            if document.is_valid_document() {
                txn.caches
                    .remote_documents
                    .add_entry(document, batch_result.commit_version)?;
            }
        }
    }
    remove_mutation_batch(txn, batch)
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> DocumentKeySet {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(batch_result.mutation_results.iter())
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

/// Writes remote updates that are newer than what is cached. Returns the
/// documents written plus the keys whose existence flipped.
fn populate_document_changes(
    txn: &mut PersistenceTransaction<'_>,
    documents: &MutableDocumentMap,
) -> FirestoreResult<(MutableDocumentMap, DocumentKeySet)> {
    let keys: DocumentKeySet = documents.keys().cloned().collect();
    let existing = txn.caches.remote_documents.get_entries(&keys);
    let mut changed = MutableDocumentMap::new();
    let mut existence_changed = BTreeSet::new();
    for (key, document) in documents {
        let existing_document = existing
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()));
        if document.is_found_document() != existing_document.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes drop the entry; access to the document was lost.
            txn.caches.remote_documents.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing_document.is_valid_document()
            || document.version() > existing_document.version()
            || (document.version() == existing_document.version()
                && existing_document.has_pending_writes())
        {
            txn.caches
                .remote_documents
                .add_entry(document.clone(), document.read_time())?;
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                target: LOG_TARGET,
                "ignoring outdated watch update for {key}: current version {}, watch version {}",
                existing_document.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

/// Whether the updated target data is worth writing back: a first resume
/// token, a token older than five minutes, or a change in the document set.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len()
        > 0
}
