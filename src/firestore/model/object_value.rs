use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Set of field paths touched by a patch or produced by a local view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// True if `path` or one of its parents is part of the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn insert(&mut self, field: FieldPath) {
        self.fields.insert(field);
    }

    pub fn union_with(&mut self, other: &FieldMask) {
        self.fields.extend(other.fields.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Immutable-by-default document body.
///
/// Clones share the underlying map; the first write after a clone copies it.
#[derive(Clone, Debug, Default)]
pub struct ObjectValue {
    fields: Arc<MapValue>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            fields: Arc::new(MapValue::new(fields)),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        self.fields.fields()
    }

    pub fn to_map_value(&self) -> MapValue {
        self.fields.as_ref().clone()
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from_map(self.fields().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value at `path`, or `None` when a segment is missing or not a map.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = self.fields.fields();
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.get(segment)?;
            if index + 1 == segments.len() {
                return Some(value);
            }
            current = value.as_map()?.fields();
        }
        None
    }

    /// Writes `value` at `path`, replacing non-map parents with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let fields = Arc::make_mut(&mut self.fields).fields_mut();
        set_in(fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        if self.field(path).is_none() {
            return;
        }
        let fields = Arc::make_mut(&mut self.fields).fields_mut();
        delete_in(fields, path.segments());
    }

    /// Applies every `Some` as a set and every `None` as a delete.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of the object; empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        collect_leaves(self.fields.fields(), None, &mut mask);
        mask
    }
}

fn set_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let entry = fields
        .entry(first.clone())
        .or_insert_with(FirestoreValue::empty_map);
    if entry.as_map().is_none() {
        *entry = FirestoreValue::empty_map();
    }
    if let Some(child) = entry.map_value_mut() {
        set_in(child.fields_mut(), rest, value);
    }
}

fn delete_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(child) = fields.get_mut(first).and_then(FirestoreValue::map_value_mut) {
        delete_in(child.fields_mut(), rest);
    }
}

fn collect_leaves(
    fields: &BTreeMap<String, FirestoreValue>,
    parent: Option<&FieldPath>,
    mask: &mut FieldMask,
) {
    for (key, value) in fields {
        let path = match parent {
            Some(parent) => parent.child(key.clone()),
            None => FieldPath::new([key.clone()]).unwrap_or_else(|_| FieldPath::document_id()),
        };
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => {
                collect_leaves(child.fields(), Some(&path), mask)
            }
            _ => mask.insert(path),
        }
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields) || self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn sets_nested_values_and_replaces_scalars() {
        let mut object = ObjectValue::empty();
        object.set(&field("a"), FirestoreValue::from_integer(1));
        object.set(&field("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(object.field(&field("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn clones_do_not_observe_writes() {
        let mut original = ObjectValue::empty();
        original.set(&field("x"), FirestoreValue::from_bool(true));
        let snapshot = original.clone();
        original.delete(&field("x"));
        assert!(original.field(&field("x")).is_none());
        assert_eq!(snapshot.field(&field("x")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&field("a.b"), FirestoreValue::from_integer(1));
        object.set(&field("c"), FirestoreValue::empty_map());
        let mask = object.field_mask();
        assert!(mask.covers(&field("a.b")));
        assert!(mask.covers(&field("c.d")));
        assert!(!mask.covers(&field("a")));
    }
}
