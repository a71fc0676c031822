use std::collections::BTreeMap;

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Condition the backend checks before applying a write.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Optimistic result computed before the server has seen the write.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp_placeholder(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_add(&base, operand)
            }
        }
    }

    /// Final value once the server acknowledged the write with `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// Value the transform should be based on when re-applied on top of remote
    /// changes; only increments need one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    FirestoreValue::from_array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

fn numeric_add(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta)
        {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        _ => {
            let current = base.as_double().unwrap_or(0.0);
            let delta = operand.as_double().unwrap_or(0.0);
            FirestoreValue::from_double(current + delta)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Server outcome of one write inside an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Commit or update version of the document after the write.
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetMutation {
    pub key: DocumentKey,
    pub value: ObjectValue,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchMutation {
    pub key: DocumentKey,
    pub data: ObjectValue,
    pub field_mask: FieldMask,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifyMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

/// One intended change to a single document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set(SetMutation),
    Patch(PatchMutation),
    Delete(DeleteMutation),
    Verify(VerifyMutation),
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set(SetMutation {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        })
    }

    pub fn patch(
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
    ) -> Self {
        Mutation::Patch(PatchMutation {
            key,
            data,
            field_mask,
            precondition,
            field_transforms: Vec::new(),
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete(DeleteMutation {
            key,
            precondition: Precondition::None,
        })
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify(VerifyMutation { key, precondition })
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set(set) => set.field_transforms = transforms,
            Mutation::Patch(patch) => patch.field_transforms = transforms,
            Mutation::Delete(_) | Mutation::Verify(_) => {}
        }
        self
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set(set) => set.precondition = precondition,
            Mutation::Patch(patch) => patch.precondition = precondition,
            Mutation::Delete(delete) => delete.precondition = precondition,
            Mutation::Verify(verify) => verify.precondition = precondition,
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set(set) => &set.key,
            Mutation::Patch(patch) => &patch.key,
            Mutation::Delete(delete) => &delete.key,
            Mutation::Verify(verify) => &verify.key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set(set) => &set.precondition,
            Mutation::Patch(patch) => &patch.precondition,
            Mutation::Delete(delete) => &delete.precondition,
            Mutation::Verify(verify) => &verify.precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set(set) => &set.field_transforms,
            Mutation::Patch(patch) => &patch.field_transforms,
            Mutation::Delete(_) | Mutation::Verify(_) => &[],
        }
    }

    /// Fields a patch writes; `None` for mutations that cover the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch(patch) => Some(patch.field_mask.clone()),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Mutation::Patch(_))
    }

    /// Applies the acknowledged write to `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set(set) => {
                let transform_results =
                    server_transform_results(document, &set.field_transforms, &result.transform_results);
                let mut data = set.value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch(patch) => {
                if !patch.precondition.is_valid_for(document) {
                    // The patch could not apply on the server; we only know the
                    // document exists at the commit version.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = server_transform_results(
                    document,
                    &patch.field_transforms,
                    &result.transform_results,
                );
                let mut data = document.data().clone();
                data.set_all(patch_values(patch));
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete(_) => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify(_) => {}
        }
    }

    /// Applies the write optimistically and returns the fields it touched;
    /// `None` means the whole document was replaced.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set(set) => {
                let transform_results =
                    local_transform_results(local_write_time, document, &set.field_transforms);
                let mut data = set.value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch(patch) => {
                let transform_results =
                    local_transform_results(local_write_time, document, &patch.field_transforms);
                let mut data = document.data().clone();
                data.set_all(patch_values(patch));
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                let mut mask = previous_mask?;
                mask.union_with(&patch.field_mask);
                for transform in &patch.field_transforms {
                    mask.insert(transform.field.clone());
                }
                Some(mask)
            }
            Mutation::Delete(_) => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify(_) => previous_mask,
        }
    }

    /// Base values that keep increments idempotent when re-applied on top of a
    /// newer remote document.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        for transform in self.field_transforms() {
            let existing = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field, value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }
}

fn patch_values(patch: &PatchMutation) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    patch
        .field_mask
        .fields()
        .iter()
        .map(|path| (path.clone(), patch.data.field(path).cloned()))
        .collect()
}

fn server_transform_results(
    document: &MutableDocument,
    transforms: &[FieldTransform],
    results: &[FirestoreValue],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_remote_document(previous, results.get(index).cloned());
            (transform.field.clone(), Some(value))
        })
        .collect()
}

fn local_transform_results(
    local_write_time: Timestamp,
    document: &MutableDocument,
    transforms: &[FieldTransform],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_local_view(previous, local_write_time);
            (transform.field.clone(), Some(value))
        })
        .collect()
}

/// Single mutation equivalent to the local changes made to `document`, or
/// `None` if it has none. A `None` mask means the whole document changed.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };
    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch_value = ObjectValue::empty();
    let mut patch_mask = FieldMask::empty();
    for path in mask.fields() {
        if patch_mask.fields().contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.field(&path).cloned();
        // A deleted nested field is expressed by patching its parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        patch_mask.insert(path);
    }
    Some(Mutation::patch(
        document.key().clone(),
        patch_value,
        patch_mask,
        Precondition::None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("collection/key").unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (path, entry) in entries {
            value.set(&field(path), entry.clone());
        }
        value
    }

    fn found(entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        MutableDocument::new_found(
            key(),
            SnapshotVersion::new(Timestamp::new(0, 1)),
            object(entries),
        )
    }

    #[test]
    fn patch_merges_into_existing_data() {
        let mut document = found(&[("foo.bar", "bar-value".into()), ("baz", "baz-value".into())]);
        let patch = Mutation::patch(
            key(),
            object(&[("foo.bar", "new-bar-value".into())]),
            FieldMask::new([field("foo.bar")]),
            Precondition::None,
        );
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());

        assert!(document.has_local_mutations());
        assert_eq!(document.field(&field("foo.bar")), Some(&"new-bar-value".into()));
        assert_eq!(document.field(&field("baz")), Some(&"baz-value".into()));
        assert!(mask.unwrap().covers(&field("foo.bar")));
    }

    #[test]
    fn patch_with_exists_precondition_skips_missing_document() {
        let mut document = MutableDocument::new_invalid(key());
        let patch = Mutation::patch(
            key(),
            object(&[("a", 1i64.into())]),
            FieldMask::new([field("a")]),
            Precondition::Exists(true),
        );
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert!(!document.is_valid_document());
        assert_eq!(mask, Some(FieldMask::empty()));
    }

    #[test]
    fn increment_overflow_becomes_double() {
        let mut document = found(&[("n", FirestoreValue::from_integer(i64::MAX))]);
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            )]);
        mutation.apply_to_local_view(&mut document, None, Timestamp::now());
        assert_eq!(
            document.field(&field("n")),
            Some(&FirestoreValue::from_double(i64::MAX as f64 + 1.0))
        );
    }

    #[test]
    fn increment_on_non_numeric_uses_zero_base() {
        let mut document = found(&[("n", "text".into())]);
        let mutation = Mutation::set(key(), object(&[("n", "text".into())])).with_transforms(vec![
            FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(3)),
            ),
        ]);
        mutation.apply_to_local_view(&mut document, None, Timestamp::now());
        assert_eq!(document.field(&field("n")), Some(&FirestoreValue::from_integer(3)));
    }

    #[test]
    fn array_transforms_union_and_remove() {
        let mut document = found(&[(
            "tags",
            FirestoreValue::from_array(vec!["a".into(), "b".into(), "a".into()]),
        )]);
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![
                FieldTransform::new(field("tags"), TransformOperation::ArrayRemove(vec!["a".into()])),
                FieldTransform::new(field("other"), TransformOperation::ArrayUnion(vec!["x".into()])),
            ]);
        mutation.apply_to_local_view(&mut document, None, Timestamp::now());
        assert_eq!(
            document.field(&field("tags")),
            Some(&FirestoreValue::from_array(vec!["b".into()]))
        );
        assert_eq!(
            document.field(&field("other")),
            Some(&FirestoreValue::from_array(vec!["x".into()]))
        );
    }

    #[test]
    fn server_timestamp_resolves_on_acknowledgement() {
        let mut document = found(&[("a", 1i64.into())]);
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![FieldTransform::new(field("ts"), TransformOperation::ServerTimestamp)]);
        mutation.apply_to_local_view(&mut document, None, Timestamp::new(5, 0));
        assert!(document.field(&field("ts")).unwrap().is_server_timestamp());

        let commit = SnapshotVersion::new(Timestamp::new(6, 0));
        let mut remote = found(&[("a", 1i64.into())]);
        mutation.apply_to_remote_document(
            &mut remote,
            &MutationResult {
                version: commit,
                transform_results: vec![FirestoreValue::from_timestamp(Timestamp::new(6, 0))],
            },
        );
        assert!(remote.has_committed_mutations());
        assert_eq!(
            remote.field(&field("ts")),
            Some(&FirestoreValue::from_timestamp(Timestamp::new(6, 0)))
        );
    }

    #[test]
    fn delete_acknowledgement_yields_no_document() {
        let mut document = found(&[]);
        Mutation::delete(key()).apply_to_remote_document(
            &mut document,
            &MutationResult {
                version: SnapshotVersion::new(Timestamp::new(9, 0)),
                transform_results: Vec::new(),
            },
        );
        assert!(document.is_no_document());
        assert!(document.has_committed_mutations());
    }

    #[test]
    fn overlay_for_deleted_nested_field_patches_parent() {
        let mut document = found(&[("a.b", 1i64.into()), ("a.c", 2i64.into())]);
        let patch = Mutation::patch(
            key(),
            ObjectValue::empty(),
            FieldMask::new([field("a.b")]),
            Precondition::None,
        );
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch(patch) => {
                assert!(patch.field_mask.fields().contains(&field("a")));
                assert_eq!(patch.data.field(&field("a.c")), Some(&2i64.into()));
            }
            other => panic!("expected patch overlay, got {other:?}"),
        }
    }

    #[test]
    fn extract_base_value_for_increment() {
        let document = found(&[("n", 7i64.into())]);
        let mutation = Mutation::set(key(), ObjectValue::empty()).with_transforms(vec![
            FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            ),
        ]);
        let base = mutation.extract_base_value(&document).unwrap();
        assert_eq!(base.field(&field("n")), Some(&7i64.into()));
    }
}
