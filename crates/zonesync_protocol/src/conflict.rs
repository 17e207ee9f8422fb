//! Merge policies and field-level diffs.

use crate::record::{FieldMap, FieldValue};

/// Policy applied when an incoming record targets an object with local,
/// not yet uploaded changes.
///
/// Configured per model adapter, never globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Incoming values overwrite local ones, even dirty fields.
    #[default]
    ServerWins,
    /// Incoming values are discarded; the local version is pushed next.
    ClientWins,
    /// A conflict delegate decides field by field.
    Custom,
}

impl MergePolicy {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            MergePolicy::ServerWins => 1,
            MergePolicy::ClientWins => 2,
            MergePolicy::Custom => 3,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MergePolicy::ServerWins),
            2 => Some(MergePolicy::ClientWins),
            3 => Some(MergePolicy::Custom),
            _ => None,
        }
    }
}

/// Field-level difference between a local object and an incoming record.
///
/// Reference fields are never part of the diff; they are linked through the
/// pending relationship ledger instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldChanges {
    /// Every differing field, with `FieldValue::Null` standing in for a value
    /// the incoming record clears.
    pub changes: FieldMap,
    /// The differing fields that carry a non-null incoming value.
    pub non_null: FieldMap,
}

impl FieldChanges {
    /// Computes the diff from `local` to `incoming`, skipping fields for
    /// which `ignore` returns true.
    pub fn between<F>(local: &FieldMap, incoming: &FieldMap, ignore: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let mut diff = FieldChanges::default();

        for (name, value) in incoming {
            if ignore(name) || value.as_reference().is_some() {
                continue;
            }
            if local.get(name) != Some(value) {
                diff.changes.insert(name.clone(), value.clone());
                if !value.is_null() {
                    diff.non_null.insert(name.clone(), value.clone());
                }
            }
        }

        for (name, value) in local {
            if ignore(name) || value.as_reference().is_some() || incoming.contains_key(name) {
                continue;
            }
            if !value.is_null() {
                diff.changes.insert(name.clone(), FieldValue::Null);
            }
        }

        diff
    }

    /// Returns true if nothing differs.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the names of all differing fields.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn policy_codes() {
        for policy in [
            MergePolicy::ServerWins,
            MergePolicy::ClientWins,
            MergePolicy::Custom,
        ] {
            assert_eq!(MergePolicy::from_code(policy.to_code()), Some(policy));
        }
        assert_eq!(MergePolicy::from_code(0), None);
        assert_eq!(MergePolicy::default(), MergePolicy::ServerWins);
    }

    #[test]
    fn diff_reports_changed_and_cleared_fields() {
        let local = map(&[
            ("x", FieldValue::Integer(1)),
            ("y", FieldValue::Integer(2)),
            ("note", FieldValue::Text("keep".into())),
        ]);
        let incoming = map(&[("x", FieldValue::Integer(5)), ("y", FieldValue::Integer(2))]);

        let diff = FieldChanges::between(&local, &incoming, |_| false);
        assert_eq!(diff.changes.get("x"), Some(&FieldValue::Integer(5)));
        assert_eq!(diff.changes.get("note"), Some(&FieldValue::Null));
        assert!(!diff.changes.contains_key("y"));
        assert_eq!(diff.non_null.len(), 1);
        assert!(diff.non_null.contains_key("x"));
    }

    #[test]
    fn diff_skips_references_and_ignored_keys() {
        let local = map(&[("device", FieldValue::Text("a".into()))]);
        let incoming = map(&[
            ("device", FieldValue::Text("b".into())),
            ("owner", FieldValue::Reference("User.1".into())),
        ]);

        let diff = FieldChanges::between(&local, &incoming, |k| k == "device");
        assert!(diff.is_empty());
    }

    #[test]
    fn structural_equality_only() {
        let local = map(&[("ratio", FieldValue::Double(0.5))]);
        let incoming = map(&[("ratio", FieldValue::Double(0.5))]);
        assert!(FieldChanges::between(&local, &incoming, |_| false).is_empty());

        let incoming = map(&[("ratio", FieldValue::Integer(0))]);
        assert!(!FieldChanges::between(&local, &incoming, |_| false).is_empty());
    }

    fn value_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Bool),
            (-5i64..5).prop_map(FieldValue::Integer),
            "[a-c]{0,2}".prop_map(FieldValue::Text),
        ]
    }

    fn map_strategy() -> impl Strategy<Value = FieldMap> {
        prop::collection::btree_map("[a-e]", value_strategy(), 0..5)
    }

    proptest! {
        #[test]
        fn applying_diff_reproduces_incoming(local in map_strategy(), incoming in map_strategy()) {
            let diff = FieldChanges::between(&local, &incoming, |_| false);

            let mut merged = local.clone();
            for (name, value) in &diff.changes {
                merged.insert(name.clone(), value.clone());
            }
            merged.retain(|_, v| !v.is_null());

            let mut expected = incoming.clone();
            expected.retain(|_, v| !v.is_null());
            prop_assert_eq!(merged, expected);
        }
    }
}
