use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::{Bound, Direction, FieldFilter, Filter, FilterOperator, OrderBy, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentComparator, DocumentKey, FieldPath, MutableDocument, ResourcePath,
};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// Client-side query: what the user asked for, before normalisation into a [`Target`].
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub explicit_order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<i64>,
    pub limit_type: LimitType,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(&self, filter: impl Into<Filter>) -> Self {
        let mut query = self.clone();
        query.filters.push(filter.into());
        query
    }

    pub fn with_order_by(&self, order_by: OrderBy) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "Invalid query. You must not call start_at() or end_at() before calling order_by().",
            ));
        }
        let mut query = self.clone();
        query.explicit_order_by.push(order_by);
        Ok(query)
    }

    pub fn with_limit(&self, limit: i64, limit_type: LimitType) -> FirestoreResult<Self> {
        if limit <= 0 {
            return Err(invalid_argument(format!(
                "Function limit() requires a positive number, but it was: {limit}."
            )));
        }
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = limit_type;
        Ok(query)
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// True for plain collection scans without constraints.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit orderings, then inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    /// Server-facing target; `limit_to_last` flips orderings and swaps bounds.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Whether `document` belongs to the query result (ignoring limits).
    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.matches_filters(document)
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let path = document.key().path();
        match &self.collection_group {
            Some(group) => document.key().has_collection_id(group) && self.path.is_prefix_of(path),
            None if DocumentKey::is_document_key(&self.path) => &self.path == path,
            None => self.path.is_immediate_parent_of(path),
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Document ordering used by views of this query.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            for order in &order_by {
                match order.compare_documents(left, right) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        })
    }

    /// Collection path to scan for this query; for collection groups the caller
    /// fans out across matching parents.
    pub fn collection_path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn where_field(
        &self,
        field: FieldPath,
        op: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        Ok(self.with_filter(FieldFilter::new(field, op, value)?))
    }
}
