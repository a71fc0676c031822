use std::collections::HashSet;

use crate::firestore::core::{ListenSequenceNumber, TargetId};
use crate::firestore::local::persistence::PersistenceCaches;
use crate::firestore::settings::{LruParams, CACHE_SIZE_UNLIMITED};

const LOG_TARGET: &str = "firestore::lru";

/// Sequence number returned when there is nothing to collect.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Cache access needed by [`LruGarbageCollector`].
pub trait LruDelegate {
    /// Number of targets plus orphaned documents.
    fn sequence_number_count(&self, caches: &PersistenceCaches<'_>) -> usize;

    fn sequence_numbers(&self, caches: &PersistenceCaches<'_>) -> Vec<ListenSequenceNumber>;

    /// Removes inactive targets last used at or before `upper_bound`.
    fn remove_targets(
        &mut self,
        caches: &mut PersistenceCaches<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> usize;

    /// Removes unpinned documents released at or before `upper_bound`.
    fn remove_orphaned_documents(
        &mut self,
        caches: &mut PersistenceCaches<'_>,
        upper_bound: ListenSequenceNumber,
    ) -> usize;

    fn cache_size(&self, caches: &PersistenceCaches<'_>) -> usize;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    cache_size_threshold: i64,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams, cache_size_threshold: i64) -> Self {
        Self {
            params,
            cache_size_threshold,
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// How many sequence numbers make up `percentile` percent of the cache.
    pub fn calculate_target_count(&self, delegate: &dyn LruDelegate, caches: &PersistenceCaches<'_>, percentile: u32) -> usize {
        let count = delegate.sequence_number_count(caches);
        (f64::from(percentile) / 100.0 * count as f64).floor() as usize
    }

    /// The `n`th smallest sequence number in use.
    pub fn nth_sequence_number(&self, delegate: &dyn LruDelegate, caches: &PersistenceCaches<'_>, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut sequence_numbers = delegate.sequence_numbers(caches);
        sequence_numbers.sort_unstable();
        sequence_numbers
            .get(n - 1)
            .or_else(|| sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    pub fn collect(
        &self,
        delegate: &mut dyn LruDelegate,
        caches: &mut PersistenceCaches<'_>,
        active_target_ids: &HashSet<TargetId>,
    ) -> LruResults {
        if self.cache_size_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!(target: LOG_TARGET, "garbage collection skipped; disabled");
            return LruResults::default();
        }
        let cache_size = delegate.cache_size(caches) as i64;
        if cache_size < self.cache_size_threshold {
            log::debug!(
                target: LOG_TARGET,
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.cache_size_threshold
            );
            return LruResults::default();
        }
        self.run_garbage_collection(delegate, caches, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        delegate: &mut dyn LruDelegate,
        caches: &mut PersistenceCaches<'_>,
        active_target_ids: &HashSet<TargetId>,
    ) -> LruResults {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(delegate, caches, self.params.percentile_to_collect);
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                target: LOG_TARGET,
                "capping garbage collection to {} sequence numbers",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(delegate, caches, sequence_numbers_to_collect);
        let targets_removed = delegate.remove_targets(caches, upper_bound, active_target_ids);
        let documents_removed = delegate.remove_orphaned_documents(caches, upper_bound);
        log::debug!(
            target: LOG_TARGET,
            "LRU garbage collection: removed {targets_removed} targets and {documents_removed} documents up to sequence number {upper_bound}"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        }
    }
}
