use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::firestore::core::{ListenSequenceNumber, Query, Target, TargetId, User};
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::memory_document_overlay_cache::MemoryDocumentOverlayCache;
use crate::firestore::local::memory_mutation_queue::MemoryMutationQueue;
use crate::firestore::local::memory_remote_document_cache::MemoryRemoteDocumentCache;
use crate::firestore::local::memory_target_cache::MemoryTargetCache;
use crate::firestore::local::reference_delegate::{
    MemoryEagerDelegate, MemoryLruDelegate, ReferenceDelegate,
};
use crate::firestore::local::{ReferenceSet, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, Mutation,
    MutationBatch, Overlay, OverlayMap, ResourcePath, SnapshotVersion, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::settings::{FirestoreSettings, GarbageCollectorKind};
use crate::firestore::value::BytesValue;

const LOG_TARGET: &str = "firestore::persistence";

/// Position in the remote document cache, ordered by read time, then key,
/// then largest batch id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: DocumentKey::empty(),
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self {
            read_time: document.read_time(),
            document_key: document.key().clone(),
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    /// Offset that skips every document read at or before `read_time`.
    pub fn successor_of_read_time(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        let timestamp = read_time.timestamp();
        let successor = if timestamp.nanos == 999_999_999 {
            Timestamp::new(timestamp.seconds + 1, 0)
        } else {
            Timestamp::new(timestamp.seconds, timestamp.nanos + 1)
        };
        Self {
            read_time: SnapshotVersion::new(successor),
            document_key: DocumentKey::empty(),
            largest_batch_id,
        }
    }

    pub fn compare(&self, other: &IndexOffset) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

/// Queue of pending mutation batches for one user.
pub trait MutationQueue: Send {
    fn is_empty(&self) -> bool;

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: BytesValue) -> FirestoreResult<()>;

    fn get_last_stream_token(&self) -> BytesValue;

    fn set_last_stream_token(&mut self, stream_token: BytesValue);

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId;

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_document_keys(&self, keys: &DocumentKeySet) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    /// Removes `batch`, which must be the oldest batch in the queue.
    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()>;

    fn contains_key(&self, key: &DocumentKey) -> bool;

    fn perform_consistency_check(&self) -> FirestoreResult<()>;
}

/// Last known server state of every cached document.
pub trait RemoteDocumentCache: Send {
    /// Adds or replaces the entry; the document's read time is set to `read_time`.
    fn add_entry(&mut self, document: MutableDocument, read_time: SnapshotVersion) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey);

    /// Cached document, or an invalid document when nothing is cached.
    fn get_entry(&self, key: &DocumentKey) -> MutableDocument;

    fn get_entries(&self, keys: &DocumentKeySet) -> MutableDocumentMap;

    /// Documents matching `query` read after `offset`. Keys in `mutated_docs`
    /// are returned even if they do not match, so overlays can be applied.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_docs: &DocumentKeySet,
    ) -> MutableDocumentMap;

    fn keys(&self) -> Vec<DocumentKey>;

    fn size(&self) -> usize;
}

/// Cached targets plus the documents the server reported for each.
pub trait TargetCache: Send {
    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion);

    fn highest_sequence_number(&self) -> ListenSequenceNumber;

    fn allocate_target_id(&mut self) -> TargetId;

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn remove_target_data(&mut self, target_data: &TargetData);

    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn get_target_data_for_id(&self, target_id: TargetId) -> Option<TargetData>;

    fn target_count(&self) -> usize;

    fn target_sequence_numbers(&self) -> Vec<(TargetId, ListenSequenceNumber)>;

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> Vec<DocumentKey>;

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

/// Per-document overlays computed from the mutation queue.
pub trait DocumentOverlayCache: Send {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &DocumentKeySet) -> OverlayMap;

    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>);

    fn remove_overlays_for_batch_id(&mut self, keys: &DocumentKeySet, batch_id: BatchId);

    /// Overlays for documents directly under `collection` with a batch id above `since_batch_id`.
    fn get_overlays_for_collection(&self, collection: &ResourcePath, since_batch_id: BatchId) -> OverlayMap;

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> OverlayMap;
}

/// The caches of one transaction, handed to reference delegates and the
/// local documents view.
pub struct PersistenceCaches<'a> {
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub target_cache: &'a mut dyn TargetCache,
    pub overlays: &'a mut dyn DocumentOverlayCache,
    /// Documents pinned by views that are currently being raised to users.
    pub local_view_references: &'a mut ReferenceSet,
}

pub struct PersistenceTransaction<'a> {
    pub caches: PersistenceCaches<'a>,
    pub reference_delegate: &'a mut dyn ReferenceDelegate,
    pub current_sequence_number: ListenSequenceNumber,
}

struct UserCaches {
    mutation_queue: MemoryMutationQueue,
    overlays: MemoryDocumentOverlayCache,
}

/// In-memory persistence. Transactions run synchronously and are not rolled
/// back on failure.
pub struct MemoryPersistence {
    user: User,
    user_caches: HashMap<String, UserCaches>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    local_view_references: ReferenceSet,
    reference_delegate: Box<dyn ReferenceDelegate>,
    listen_sequence: ListenSequenceNumber,
    started: bool,
}

impl MemoryPersistence {
    pub fn new(settings: &FirestoreSettings) -> Self {
        let reference_delegate: Box<dyn ReferenceDelegate> = match settings.garbage_collector {
            GarbageCollectorKind::Eager => Box::new(MemoryEagerDelegate::new()),
            GarbageCollectorKind::Lru => Box::new(MemoryLruDelegate::new()),
        };
        Self {
            user: User::unauthenticated(),
            user_caches: HashMap::new(),
            remote_documents: MemoryRemoteDocumentCache::new(),
            target_cache: MemoryTargetCache::new(),
            local_view_references: ReferenceSet::new(),
            reference_delegate,
            listen_sequence: 0,
            started: true,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn shutdown(&mut self) {
        self.started = false;
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Switches the mutation queue and overlays to those of `user`.
    pub fn set_user(&mut self, user: User) {
        self.user = user;
    }

    pub fn reference_delegate(&self) -> &dyn ReferenceDelegate {
        self.reference_delegate.as_ref()
    }

    pub fn run_transaction<T>(
        &mut self,
        action: &str,
        operation: impl FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        if !self.started {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        log::trace!(target: LOG_TARGET, "starting transaction: {action}");

        let user_caches = self
            .user_caches
            .entry(self.user.to_key())
            .or_insert_with(|| UserCaches {
                mutation_queue: MemoryMutationQueue::new(),
                overlays: MemoryDocumentOverlayCache::new(),
            });
        self.listen_sequence += 1;
        let current_sequence_number = self.listen_sequence;
        self.reference_delegate
            .on_transaction_started(current_sequence_number);

        let mut transaction = PersistenceTransaction {
            caches: PersistenceCaches {
                mutation_queue: &mut user_caches.mutation_queue,
                remote_documents: &mut self.remote_documents,
                target_cache: &mut self.target_cache,
                overlays: &mut user_caches.overlays,
                local_view_references: &mut self.local_view_references,
            },
            reference_delegate: self.reference_delegate.as_mut(),
            current_sequence_number,
        };

        let result = operation(&mut transaction)?;
        transaction
            .reference_delegate
            .on_transaction_committed(&mut transaction.caches)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn successor_offset_skips_documents_at_read_time() {
        let version = SnapshotVersion::new(Timestamp::new(5, 999_999_999));
        let offset = IndexOffset::successor_of_read_time(version, BATCH_ID_UNKNOWN);
        assert_eq!(offset.read_time, SnapshotVersion::new(Timestamp::new(6, 0)));

        let mut document = MutableDocument::new_found(key("c/a"), version, ObjectValue::empty());
        document.set_read_time(version);
        assert_eq!(
            IndexOffset::from_document(&document).compare(&offset),
            Ordering::Less
        );
    }

    #[test]
    fn terminated_persistence_rejects_transactions() {
        let mut persistence = MemoryPersistence::new(&FirestoreSettings::default());
        persistence.shutdown();
        let err = persistence
            .run_transaction("noop", |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[test]
    fn mutation_queues_are_partitioned_by_user() {
        let mut persistence = MemoryPersistence::new(&FirestoreSettings::default());
        persistence
            .run_transaction("write", |txn| {
                txn.caches.mutation_queue.add_mutation_batch(
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::delete(key("c/a"))],
                )?;
                Ok(())
            })
            .unwrap();
        persistence.set_user(User::authenticated("alice"));
        let empty = persistence
            .run_transaction("read", |txn| Ok(txn.caches.mutation_queue.is_empty()))
            .unwrap();
        assert!(empty);
    }
}
