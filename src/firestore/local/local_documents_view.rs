use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{IndexOffset, PersistenceCaches};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, DocumentKeySet, FieldMask, MutableDocument,
    MutableDocumentMap, Mutation, OverlayMap, OverlayedDocument, Timestamp,
};

/// Remote documents with pending local writes applied on top, read through
/// the overlay cache.
pub struct LocalDocumentsView<'c, 'a> {
    caches: &'c mut PersistenceCaches<'a>,
}

impl<'c, 'a> LocalDocumentsView<'c, 'a> {
    pub fn new(caches: &'c mut PersistenceCaches<'a>) -> Self {
        Self { caches }
    }

    /// Local view of `key`; an invalid document when nothing is known.
    pub fn get_document(&mut self, key: &DocumentKey) -> MutableDocument {
        let overlay = self.caches.overlays.get_overlay(key);
        let mut document = match &overlay {
            Some(overlay) if !overlay.mutation.is_patch() => MutableDocument::new_invalid(key.clone()),
            _ => self.caches.remote_documents.get_entry(key),
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(&mut self, keys: &DocumentKeySet) -> FirestoreResult<MutableDocumentMap> {
        let documents = self.caches.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed` whose
    /// overlay is missing or a patch get their overlays recalculated.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<MutableDocumentMap> {
        let overlayed = self.compute_views(documents, existence_state_changed)?;
        Ok(overlayed
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    pub fn get_overlayed_documents(
        &mut self,
        documents: MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        self.compute_views(documents, &DocumentKeySet::new())
    }

    fn compute_views(
        &mut self,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let overlays = self.caches.overlays.get_overlays(&keys);

        let mut to_recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut results = MutableDocumentMap::new();
        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            if existence_state_changed.contains(&key)
                && overlay.map_or(true, |overlay| overlay.mutation.is_patch())
            {
                to_recalculate.insert(key, document);
                continue;
            }
            match overlay {
                Some(overlay) => {
                    let mask = overlay.mutation.field_mask();
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, mask.clone(), Timestamp::now());
                    mutated_fields.insert(key.clone(), mask);
                }
                None => {
                    mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
                }
            }
            results.insert(key, document);
        }

        let (recalculated_docs, recalculated_masks) =
            self.recalculate_overlays(to_recalculate)?;
        mutated_fields.extend(recalculated_masks);
        results.extend(recalculated_docs);

        Ok(results
            .into_iter()
            .map(|(key, document)| {
                let mutated_fields = mutated_fields
                    .remove(&key)
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                )
            })
            .collect())
    }

    /// Reapplies every pending batch to `documents` and stores the resulting
    /// overlays. Returns the mutated field masks per key.
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        self.recalculate_overlays(documents).map(|(_, masks)| masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys(
        &mut self,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        let documents = self.caches.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(documents)?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn recalculate_overlays(
        &mut self,
        mut documents: MutableDocumentMap,
    ) -> FirestoreResult<(MutableDocumentMap, BTreeMap<DocumentKey, Option<FieldMask>>)> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let batches = self
            .caches
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(&keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, mask);
                masks.insert(key.clone(), mask);
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key);
            }
        }

        let mut processed: BTreeSet<DocumentKey> = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().flatten();
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key, mutation);
                }
            }
            self.caches.overlays.save_overlays(batch_id, overlays);
        }
        Ok((documents, masks))
    }

    /// Local view of every document matching `query` read after `offset`.
    pub fn get_documents_matching_query(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<MutableDocumentMap> {
        if query.is_document_query() {
            return Ok(self.get_documents_matching_document_query(query));
        }
        let overlays = match &query.collection_group {
            Some(group) => self
                .caches
                .overlays
                .get_overlays_for_collection_group(group, offset.largest_batch_id),
            None => self
                .caches
                .overlays
                .get_overlays_for_collection(&query.path, offset.largest_batch_id),
        };
        Ok(self.apply_overlays_to_query_results(query, offset, overlays))
    }

    fn get_documents_matching_document_query(&mut self, query: &Query) -> MutableDocumentMap {
        let mut result = MutableDocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path.clone()) {
            let document = self.get_document(&key);
            if document.is_found_document() {
                result.insert(key, document);
            }
        }
        result
    }

    fn apply_overlays_to_query_results(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
        overlays: OverlayMap,
    ) -> MutableDocumentMap {
        let overlay_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut remote_documents =
            self.caches
                .remote_documents
                .get_documents_matching_query(query, offset, &overlay_keys);
        // Documents can match only because of their overlay, so every overlay
        // needs a base document.
        for key in overlay_keys {
            remote_documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid(key));
        }

        let now = Timestamp::now();
        remote_documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }
}
