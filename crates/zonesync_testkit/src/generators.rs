//! Property-based test generators using proptest.

use proptest::prelude::*;
use zonesync_engine::LocalObject;
use zonesync_protocol::{FieldMap, FieldValue};

/// Strategy for field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for plain field values: no nulls and no references.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Integer),
        (-1.0e9f64..1.0e9).prop_map(FieldValue::Double),
        "[ -~]{0,24}".prop_map(FieldValue::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(FieldValue::Bytes),
        any::<i64>().prop_map(FieldValue::Date),
    ];
    leaf.prop_recursive(2, 8, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(FieldValue::List)
    })
}

/// Strategy for a map of plain fields.
pub fn field_map_strategy() -> impl Strategy<Value = FieldMap> {
    prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 0..6)
}

/// Strategy for objects with distinct identifiers `Item.0`, `Item.1`, ...
pub fn objects_strategy(max: usize) -> impl Strategy<Value = Vec<LocalObject>> {
    prop::collection::vec(field_map_strategy(), 0..=max).prop_map(|maps| {
        maps.into_iter()
            .enumerate()
            .map(|(i, fields)| LocalObject {
                identifier: format!("Item.{i}"),
                entity_type: "Item".to_string(),
                fields,
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn field_values_are_plain(value in field_value_strategy()) {
            prop_assert!(!value.is_null());
            prop_assert!(value.as_reference().is_none());
        }

        #[test]
        fn object_identifiers_are_distinct(objects in objects_strategy(8)) {
            let mut ids: Vec<_> = objects.iter().map(|o| o.identifier.clone()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), objects.len());
        }
    }
}
