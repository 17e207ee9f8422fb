//! Model adapter contract.
//!
//! A [`ModelAdapter`] bridges the engine to one concrete local store for one
//! zone. The engine borrows adapters per cycle and never sees domain objects
//! directly. Adapter methods run without suspension; they may be called from
//! whichever task drives the cycle.

use crate::error::{SyncError, SyncResult};
use zonesync_protocol::{
    ChangeToken, FieldChanges, FieldMap, MergePolicy, RecordId, RemoteRecord, ZoneId,
};

/// Local-store side of synchronization for one zone.
pub trait ModelAdapter: Send + Sync {
    /// Zone this adapter synchronizes.
    fn zone(&self) -> &ZoneId;

    /// Returns true if any tracked object is not `Synced`.
    fn has_pending_local_changes(&self) -> SyncResult<bool>;

    /// Opens an import batch. Calling it while a batch is open is a no-op.
    fn begin_import(&self) -> SyncResult<()>;

    /// Merges remote records into local objects under the active merge policy.
    ///
    /// Each record is applied entirely or not at all. References to objects
    /// not yet present locally are queued as pending relationships.
    fn apply_remote_changes(&self, records: &[RemoteRecord]) -> SyncResult<()>;

    /// Removes objects deleted remotely. Unknown identifiers are ignored.
    fn apply_remote_deletions(&self, ids: &[RecordId]) -> SyncResult<()>;

    /// Links every pending relationship whose target now exists.
    ///
    /// Returns the number of edges linked.
    fn resolve_pending_relationships(&self) -> SyncResult<usize>;

    /// Durably persists everything applied since the last commit.
    ///
    /// On failure nothing from the uncommitted batch counts as applied.
    fn commit_import(&self) -> SyncResult<()>;

    /// Closes the import batch, discarding uncommitted work.
    ///
    /// Runs on success and failure paths alike.
    fn finish_import(&self, error: Option<&SyncError>);

    /// Returns up to `limit` records for objects in `New` or `Changed`, in
    /// insertion order.
    fn changes_to_upload(&self, limit: usize) -> SyncResult<Vec<RemoteRecord>>;

    /// Marks uploaded objects `Synced` and stores the saved server records.
    fn acknowledge_uploaded(&self, saved: &[RemoteRecord]) -> SyncResult<()>;

    /// Returns up to `limit` identifiers of objects deleted locally.
    fn deletions_to_upload(&self, limit: usize) -> SyncResult<Vec<RecordId>>;

    /// Drops tracking for deletions the remote acknowledged.
    fn acknowledge_deleted(&self, ids: &[RecordId]) -> SyncResult<()>;

    /// Returns true if the local store holds the object.
    fn has_local_object(&self, identifier: &str) -> SyncResult<bool>;

    /// Wipes every tracking record, pending edge and token of this zone.
    fn reset_all_tracking(&self) -> SyncResult<()>;

    /// Returns the zone's committed change token.
    fn server_change_token(&self) -> SyncResult<Option<ChangeToken>>;

    /// Persists the zone's change token.
    fn save_token(&self, token: Option<&ChangeToken>) -> SyncResult<()>;

    /// Returns the active merge policy.
    fn merge_policy(&self) -> MergePolicy;

    /// Changes the merge policy.
    fn set_merge_policy(&self, policy: MergePolicy);
}

/// A locally modified object meeting a different incoming version.
#[derive(Debug)]
pub struct FieldConflict<'a> {
    /// Object identifier.
    pub identifier: &'a str,
    /// Object schema discriminator.
    pub entity_type: &'a str,
    /// Current local field values.
    pub local: &'a FieldMap,
    /// Field-level difference to the incoming record.
    pub changes: &'a FieldChanges,
}

/// Resolves conflicts under [`MergePolicy::Custom`].
pub trait ConflictDelegate: Send + Sync {
    /// Chooses values for any subset of fields.
    ///
    /// Returned fields are applied as given, `FieldValue::Null` clearing the
    /// field. Differing fields left out take the incoming value. A field
    /// whose chosen value differs from the incoming one stays dirty and is
    /// uploaded on the next push.
    fn resolve(&self, conflict: &FieldConflict<'_>) -> SyncResult<FieldMap>;
}

/// Delegate that keeps every local value.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepLocalDelegate;

impl ConflictDelegate for KeepLocalDelegate {
    fn resolve(&self, conflict: &FieldConflict<'_>) -> SyncResult<FieldMap> {
        Ok(conflict
            .changes
            .field_names()
            .map(|name| {
                let value = conflict
                    .local
                    .get(name)
                    .cloned()
                    .unwrap_or(zonesync_protocol::FieldValue::Null);
                (name.to_string(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_protocol::FieldValue;

    #[test]
    fn keep_local_delegate_returns_local_values() {
        let local: FieldMap = [
            ("x".to_string(), FieldValue::Integer(1)),
            ("y".to_string(), FieldValue::Integer(2)),
        ]
        .into_iter()
        .collect();
        let incoming: FieldMap = [
            ("x".to_string(), FieldValue::Integer(5)),
            ("z".to_string(), FieldValue::Integer(9)),
        ]
        .into_iter()
        .collect();
        let changes = FieldChanges::between(&local, &incoming, |_| false);

        let chosen = KeepLocalDelegate
            .resolve(&FieldConflict {
                identifier: "a",
                entity_type: "Note",
                local: &local,
                changes: &changes,
            })
            .unwrap();

        assert_eq!(chosen.get("x"), Some(&FieldValue::Integer(1)));
        assert_eq!(chosen.get("y"), Some(&FieldValue::Integer(2)));
        assert_eq!(chosen.get("z"), Some(&FieldValue::Null));
    }
}
