use std::collections::{BTreeMap, HashSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, ObjectValue, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, SentinelValue, ValueKind};

/// Options that configure the behaviour of `set_doc` writes.
///
/// Mirrors the modular JS `SetOptions` type, including `merge` and
/// `mergeFields` support.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merge the provided data into the existing document instead of
    /// overwriting it.
    pub merge: bool,
    /// Explicit field mask to merge. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    /// Builds set options that merge every field present in the provided data.
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    /// Builds set options that merge only the specified field paths.
    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for field in fields {
            if seen.insert(field.canonical_string()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UserDataSource {
    Set,
    MergeSet,
    Update,
    Argument,
}

impl UserDataSource {
    fn method_name(self) -> &'static str {
        match self {
            UserDataSource::Set | UserDataSource::MergeSet => "set_doc()",
            UserDataSource::Update => "update_doc()",
            UserDataSource::Argument => "a query argument",
        }
    }
}

/// Accumulates the field mask and transforms found while walking user data.
struct ParseContext {
    source: UserDataSource,
    field_mask: Vec<FieldPath>,
    field_transforms: Vec<FieldTransform>,
}

impl ParseContext {
    fn new(source: UserDataSource) -> Self {
        Self {
            source,
            field_mask: Vec::new(),
            field_transforms: Vec::new(),
        }
    }

    fn contains(&self, path: &FieldPath) -> bool {
        self.field_mask.iter().any(|field| path.is_prefix_of(field))
            || self
                .field_transforms
                .iter()
                .any(|transform| path.is_prefix_of(&transform.field))
    }
}

/// User data ready to be turned into a `Set` or `Patch` mutation.
#[derive(Clone, Debug)]
pub(crate) struct ParsedSetData {
    data: ObjectValue,
    field_mask: Option<FieldMask>,
    field_transforms: Vec<FieldTransform>,
}

impl ParsedSetData {
    pub(crate) fn into_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        let mutation = match self.field_mask {
            Some(mask) => Mutation::patch(key, self.data, mask, precondition),
            None => Mutation::set(key, self.data).with_precondition(precondition),
        };
        mutation.with_transforms(self.field_transforms)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ParsedUpdateData {
    data: ObjectValue,
    field_mask: FieldMask,
    field_transforms: Vec<FieldTransform>,
}

impl ParsedUpdateData {
    pub(crate) fn into_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        Mutation::patch(key, self.data, self.field_mask, precondition).with_transforms(self.field_transforms)
    }
}

/// Parses `set_doc` input, extracting sentinels into field transforms.
pub(crate) fn parse_set_data(
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<ParsedSetData> {
    let source = if options.is_merge() {
        UserDataSource::MergeSet
    } else {
        UserDataSource::Set
    };
    let mut context = ParseContext::new(source);
    let parsed = parse_object(&data, &[], &mut context)?;
    let data = ObjectValue::from_map(parsed);

    let (field_mask, field_transforms) = if let Some(merge_fields) = &options.merge_fields {
        for field in merge_fields {
            if !context.contains(field) {
                return Err(invalid_argument(format!(
                    "Field '{}' is specified in your field mask but missing from your input data.",
                    field.canonical_string()
                )));
            }
        }
        let transforms = context
            .field_transforms
            .into_iter()
            .filter(|transform| merge_fields.iter().any(|field| field.is_prefix_of(&transform.field)))
            .collect();
        (Some(FieldMask::new(merge_fields.iter().cloned())), transforms)
    } else if options.merge {
        (Some(FieldMask::new(context.field_mask)), context.field_transforms)
    } else {
        (None, context.field_transforms)
    };

    Ok(ParsedSetData {
        data,
        field_mask,
        field_transforms,
    })
}

/// Parses `update_doc` input. Keys are dot-separated field paths.
pub(crate) fn parse_update_data(data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<ParsedUpdateData> {
    if data.is_empty() {
        return Err(invalid_argument("Function update_doc() requires at least one field."));
    }
    let mut context = ParseContext::new(UserDataSource::Update);
    let mut object = ObjectValue::empty();
    let mut mask = FieldMask::empty();

    for (key, value) in &data {
        let path = FieldPath::from_dot_separated(key)?;
        if matches!(value.kind(), ValueKind::Sentinel(SentinelValue::Delete)) {
            mask.insert(path);
            continue;
        }
        if let Some(parsed) = parse_value(value, path.segments(), &mut context)? {
            object.set(&path, parsed);
            mask.insert(path);
        }
    }

    Ok(ParsedUpdateData {
        data: object,
        field_mask: mask,
        field_transforms: context.field_transforms,
    })
}

/// Validates a filter or cursor value. Sentinels are not allowed there.
pub(crate) fn parse_query_value(value: FirestoreValue) -> FirestoreResult<FirestoreValue> {
    let context = ParseContext::new(UserDataSource::Argument);
    reject_nested_sentinels(&value, &[], &context)?;
    Ok(value)
}

fn parse_object(
    data: &BTreeMap<String, FirestoreValue>,
    parent: &[String],
    context: &mut ParseContext,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    if data.is_empty() && !parent.is_empty() {
        context.field_mask.push(FieldPath::new(parent.to_vec())?);
    }
    let mut parsed = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent.to_vec();
        segments.push(key.clone());
        if let Some(value) = parse_value(value, &segments, context)? {
            parsed.insert(key.clone(), value);
        }
    }
    Ok(parsed)
}

/// Returns `None` for sentinels, which contribute a transform or a mask entry
/// instead of a value.
fn parse_value(
    value: &FirestoreValue,
    segments: &[String],
    context: &mut ParseContext,
) -> FirestoreResult<Option<FirestoreValue>> {
    match value.kind() {
        ValueKind::Sentinel(sentinel) => {
            parse_sentinel(sentinel, segments, context)?;
            Ok(None)
        }
        ValueKind::Map(map) => {
            let nested = parse_object(map.fields(), segments, context)?;
            Ok(Some(FirestoreValue::from_map(nested)))
        }
        ValueKind::Array(array) => {
            for element in array.values() {
                reject_nested_sentinels(element, segments, context)?;
            }
            if !segments.is_empty() {
                context.field_mask.push(FieldPath::new(segments.to_vec())?);
            }
            Ok(Some(value.clone()))
        }
        ValueKind::ServerTimestamp(_) => Err(invalid_argument(
            "Server timestamp placeholders cannot be written back as user data.",
        )),
        _ => {
            if !segments.is_empty() {
                context.field_mask.push(FieldPath::new(segments.to_vec())?);
            }
            Ok(Some(value.clone()))
        }
    }
}

fn parse_sentinel(sentinel: &SentinelValue, segments: &[String], context: &mut ParseContext) -> FirestoreResult<()> {
    let source = context.source;
    if segments.is_empty() || source == UserDataSource::Argument {
        return Err(invalid_argument(format!(
            "Sentinel values can only be used as field values, not in {}.",
            source.method_name()
        )));
    }
    let path = FieldPath::new(segments.to_vec())?;

    let operation = match sentinel {
        SentinelValue::Delete => {
            return match source {
                UserDataSource::MergeSet => {
                    context.field_mask.push(path);
                    Ok(())
                }
                UserDataSource::Update => Err(invalid_argument(format!(
                    "delete_field() can only appear at the top level of your update data (found in field {}).",
                    path.canonical_string()
                ))),
                _ => Err(invalid_argument(format!(
                    "delete_field() cannot be used with set_doc() unless you pass merge options (found in field {}).",
                    path.canonical_string()
                ))),
            };
        }
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in elements {
                reject_nested_sentinels(element, segments, context)?;
            }
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                reject_nested_sentinels(element, segments, context)?;
            }
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument(format!(
                    "increment() requires a numeric operand (found in field {}).",
                    path.canonical_string()
                )));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
    };
    context.field_transforms.push(FieldTransform::new(path, operation));
    Ok(())
}

fn reject_nested_sentinels(value: &FirestoreValue, segments: &[String], context: &ParseContext) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays or {} (field '{}').",
            context.source.method_name(),
            segments.join(".")
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| reject_nested_sentinels(element, segments, context)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| reject_nested_sentinels(element, segments, context)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::test_support::{field, key};

    fn data(entries: Vec<(&str, FirestoreValue)>) -> BTreeMap<String, FirestoreValue> {
        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    #[test]
    fn plain_set_becomes_set_mutation_with_transforms() {
        let parsed = parse_set_data(
            data(vec![
                ("name", FirestoreValue::from_string("x")),
                ("updated", FirestoreValue::server_timestamp()),
            ]),
            &SetOptions::default(),
        )
        .unwrap();
        let mutation = parsed.into_mutation(key("rooms/a"), Precondition::None);
        let Mutation::Set(set) = &mutation else {
            panic!("expected a set mutation, got {mutation:?}");
        };
        assert!(set.value.field(&field("updated")).is_none());
        assert_eq!(set.field_transforms.len(), 1);
        assert_eq!(set.field_transforms[0].field, field("updated"));
    }

    #[test]
    fn merge_set_masks_written_and_deleted_fields() {
        let nested = FirestoreValue::from_map(data(vec![("b", FirestoreValue::from_integer(1))]));
        let parsed = parse_set_data(
            data(vec![("a", nested), ("gone", FirestoreValue::delete_field())]),
            &SetOptions::merge_all(),
        )
        .unwrap();
        let mutation = parsed.into_mutation(key("rooms/a"), Precondition::None);
        let mask = mutation.field_mask().unwrap();
        assert!(mask.covers(&field("a.b")));
        assert!(mask.covers(&field("gone")));
        assert!(!mask.covers(&field("a")));
    }

    #[test]
    fn merge_fields_must_exist_in_data() {
        let err = parse_set_data(
            data(vec![("a", FirestoreValue::from_integer(1))]),
            &SetOptions::merge_fields(vec![field("b")]).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn merge_fields_drop_transforms_outside_the_mask() {
        let parsed = parse_set_data(
            data(vec![
                ("a", FirestoreValue::from_integer(1)),
                ("t", FirestoreValue::server_timestamp()),
            ]),
            &SetOptions::merge_fields(vec![field("a")]).unwrap(),
        )
        .unwrap();
        assert!(parsed.field_transforms.is_empty());
    }

    #[test]
    fn delete_field_requires_merge() {
        let err = parse_set_data(
            data(vec![("gone", FirestoreValue::delete_field())]),
            &SetOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn sentinels_are_rejected_inside_arrays() {
        let err = parse_set_data(
            data(vec![(
                "values",
                FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
            )]),
            &SetOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);

        let err = parse_set_data(
            data(vec![(
                "tags",
                FirestoreValue::array_union(vec![FirestoreValue::numeric_increment(
                    FirestoreValue::from_integer(1),
                )]),
            )]),
            &SetOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn increment_requires_numeric_operand() {
        let err = parse_update_data(data(vec![(
            "total",
            FirestoreValue::numeric_increment(FirestoreValue::from_string("five")),
        )]))
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn update_uses_dotted_paths_and_deletes() {
        let parsed = parse_update_data(data(vec![
            ("stats.count", FirestoreValue::numeric_increment(FirestoreValue::from_integer(1))),
            ("stats.name", FirestoreValue::from_string("x")),
            ("old", FirestoreValue::delete_field()),
        ]))
        .unwrap();
        assert!(parsed.field_mask.covers(&field("stats.name")));
        assert!(parsed.field_mask.covers(&field("old")));
        assert_eq!(
            parsed.data.field(&field("stats.name")),
            Some(&FirestoreValue::from_string("x"))
        );
        assert_eq!(parsed.field_transforms[0].field, field("stats.count"));
    }

    #[test]
    fn query_values_reject_sentinels() {
        assert!(parse_query_value(FirestoreValue::from_integer(3)).is_ok());
        let err = parse_query_value(FirestoreValue::server_timestamp()).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }
}
