use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::IndexOffset;
use crate::firestore::model::{
    DocumentKeySet, DocumentSet, MutableDocumentMap, SnapshotVersion, BATCH_ID_UNKNOWN,
};

const LOG_TARGET: &str = "firestore::query_engine";

/// Runs queries against the local cache. When a target was limbo-free at a
/// known snapshot, the previous result is reused and only documents read
/// since then are scanned.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        view: &mut LocalDocumentsView<'_, '_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<MutableDocumentMap> {
        if let Some(documents) = self.perform_query_using_remote_keys(
            view,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        )? {
            return Ok(documents);
        }
        self.execute_full_collection_scan(view, query)
    }

    fn perform_query_using_remote_keys(
        &self,
        view: &mut LocalDocumentsView<'_, '_>,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<MutableDocumentMap>> {
        // A full scan is just as fast when the query matches everything.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = view.get_documents(remote_keys)?;
        let previous_results = apply_query(query, documents);
        if query.has_limit()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return Ok(None);
        }

        log::debug!(
            target: LOG_TARGET,
            "re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );
        let offset =
            IndexOffset::successor_of_read_time(last_limbo_free_snapshot_version, BATCH_ID_UNKNOWN);
        let mut results = view.get_documents_matching_query(query, &offset)?;
        for document in previous_results.iter() {
            results.insert(document.key().clone(), document.clone());
        }
        Ok(Some(results))
    }

    fn execute_full_collection_scan(
        &self,
        view: &mut LocalDocumentsView<'_, '_>,
        query: &Query,
    ) -> FirestoreResult<MutableDocumentMap> {
        log::debug!(
            target: LOG_TARGET,
            "using full collection scan to execute query: {}",
            query.canonical_id()
        );
        view.get_documents_matching_query(query, &IndexOffset::none())
    }
}

fn apply_query(query: &Query, documents: MutableDocumentMap) -> DocumentSet {
    let mut results = DocumentSet::new(query.comparator());
    for document in documents.into_values() {
        if query.matches(&document) {
            results.add(document);
        }
    }
    results
}

/// Whether a limited query has to be recomputed from scratch because its
/// boundary document may have moved.
fn needs_refill(
    query: &Query,
    previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    // A document from the previous result no longer matches.
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge = match query.limit_type {
        LimitType::First => previous_results.last(),
        LimitType::Last => previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
