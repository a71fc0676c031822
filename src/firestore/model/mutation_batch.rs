use std::collections::BTreeMap;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, DocumentVersionMap, FieldMask,
    MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};
use crate::firestore::value::BytesValue;

pub type BatchId = i32;

/// Batch id used when no batch is pending.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Local document plus the fields its pending mutations touched.
#[derive(Clone, Debug)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` when the whole document is covered by local writes.
    pub mutated_fields: Option<FieldMask>,
}

/// Mutations written together by one user call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Synthetic mutations that pin transform base values; applied first, never sent.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged mutations for `document`'s key.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        if batch_result.mutation_results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                batch_result.mutation_results.len()
            )));
        }
        for (mutation, result) in self.mutations.iter().zip(batch_result.mutation_results.iter()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
        Ok(())
    }

    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document in `documents` and returns
    /// the overlay each key should carry afterwards.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mutated_fields = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.take(),
            );
            let mutated_fields = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mutated_fields
            };
            overlayed.mutated_fields = mutated_fields.clone();
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|mutation| mutation.key().clone()).collect()
    }
}

/// Acknowledgement of a batch by the write stream.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: BytesValue,
    /// Version each document reached as a result of the batch.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: BytesValue,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
