use crate::firestore::core::{Bound, Filter, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Server-facing shape of a query, as sent over the watch stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Single-document target, as used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

/// Hands out target ids. Query targets use even ids from the target cache,
/// limbo targets use odd ids from the sync engine, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(highest_seen: TargetId) -> Self {
        let mut next_id = highest_seen + 2;
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self { next_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!(cache.next(), 2);
        assert_eq!(cache.next(), 4);
        assert_eq!(sync.next(), 1);
        assert_eq!(sync.next(), 3);
        assert_eq!(TargetIdGenerator::for_target_cache(4).next(), 6);
    }

    #[test]
    fn document_target_canonical_id() {
        let target = Target::for_document(&DocumentKey::from_string("rooms/a").unwrap());
        assert!(target.is_document_target());
        assert_eq!(target.canonical_id(), "rooms/a|f:|ob:");
    }
}
