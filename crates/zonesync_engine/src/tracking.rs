//! Tracking records and the synced-entity state machine.
//!
//! Every synchronized domain object is shadowed by one [`TrackingRecord`]
//! holding its sync state, the fields edited since the last upload and the
//! last known server representation.
//!
//! ```text
//!   absent ──create──▶ New ──upload ack──▶ Synced ──edit──▶ Changed
//!                                            ▲                 │
//!                                            └───upload ack────┘
//!   any non-Deleted ──delete──▶ Deleted ──remote delete ack──▶ removed
//!   absent ──remote import──▶ Inserted ──relationships linked──▶ Synced
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::SystemTime;
use zonesync_protocol::{ProtocolResult, RemoteRecord};

/// Sync state of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Created locally, never uploaded.
    New,
    /// Uploaded before, edited locally since.
    Changed,
    /// Scheduled for remote deletion.
    Deleted,
    /// Matches the last acknowledged remote state.
    Synced,
    /// Materialized from a remote import, waiting on a pending relationship.
    Inserted,
}

impl EntityState {
    /// Returns true for states whose object must be uploaded.
    pub fn needs_upload(&self) -> bool {
        matches!(self, EntityState::New | EntityState::Changed)
    }
}

/// Sync metadata for one domain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Stable identifier, unique within the zone.
    pub identifier: String,
    /// Schema discriminator of the tracked object.
    pub entity_type: String,
    /// Current sync state.
    pub state: EntityState,
    /// Fields modified since the last successful upload.
    pub changed_keys: BTreeSet<String>,
    /// Last modification time. Diagnostics only.
    pub updated: SystemTime,
    /// Last known server representation, CBOR encoded.
    pub encoded_record: Option<Vec<u8>>,
    /// Counts local edits; an upload acknowledgment only settles the
    /// revision that was uploaded.
    #[serde(default)]
    pub revision: u64,
}

impl TrackingRecord {
    /// Tracks an object created locally.
    pub fn new_local(identifier: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self::with_state(identifier, entity_type, EntityState::New)
    }

    /// Tracks an object materialized from a remote import.
    pub fn inserted(identifier: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self::with_state(identifier, entity_type, EntityState::Inserted)
    }

    fn with_state(
        identifier: impl Into<String>,
        entity_type: impl Into<String>,
        state: EntityState,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            entity_type: entity_type.into(),
            state,
            changed_keys: BTreeSet::new(),
            updated: SystemTime::now(),
            encoded_record: None,
            revision: 0,
        }
    }

    /// Records a local edit of `keys`.
    ///
    /// `Synced` and `Inserted` become `Changed`; `New` and `Changed` stay as
    /// they are; `Deleted` ignores edits.
    pub fn mark_changed<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.state == EntityState::Deleted {
            return;
        }
        let mut keys = keys.into_iter().map(Into::into).peekable();
        if keys.peek().is_none() {
            return;
        }
        self.changed_keys.extend(keys);
        if matches!(self.state, EntityState::Synced | EntityState::Inserted) {
            self.state = EntityState::Changed;
        }
        self.bump();
    }

    /// Brings a record pending deletion back as `Changed` with every key dirty.
    pub fn reopen<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state = EntityState::Changed;
        self.changed_keys = keys.into_iter().map(Into::into).collect();
        self.bump();
    }

    /// Schedules the object for remote deletion. Returns false if it already was.
    pub fn mark_deleted(&mut self) -> bool {
        if self.state == EntityState::Deleted {
            return false;
        }
        self.state = EntityState::Deleted;
        self.bump();
        true
    }

    /// Applies an upload acknowledgment carrying the saved server record.
    ///
    /// `uploaded` is the revision the upload was built from. If the object
    /// was edited since, only the server version is recorded and the record
    /// stays pending as `Changed`.
    pub fn acknowledge_upload(
        &mut self,
        saved: &RemoteRecord,
        uploaded: u64,
    ) -> ProtocolResult<()> {
        self.encoded_record = Some(saved.encode()?);
        if self.state.needs_upload() {
            if uploaded == self.revision {
                self.state = EntityState::Synced;
                self.changed_keys.clear();
            } else {
                self.state = EntityState::Changed;
            }
        }
        self.touch();
        Ok(())
    }

    /// Marks the object as matching the remote state.
    pub fn mark_synced(&mut self) {
        self.state = EntityState::Synced;
        self.changed_keys.clear();
        self.touch();
    }

    /// Decodes the last known server representation.
    pub fn last_known_record(&self) -> ProtocolResult<Option<RemoteRecord>> {
        self.encoded_record
            .as_deref()
            .map(RemoteRecord::decode)
            .transpose()
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated = SystemTime::now();
    }
}

/// Tracking records of one zone, in insertion order.
///
/// Rows live in a sequence-numbered arena with an identifier index, so
/// upload batches come out in a stable order across retries.
#[derive(Debug, Clone, Default)]
pub struct TrackingTable {
    rows: BTreeMap<u64, TrackingRecord>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl TrackingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a table from records listed in insertion order.
    pub fn from_records(records: impl IntoIterator<Item = TrackingRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.insert(record);
        }
        table
    }

    /// Inserts a record, replacing an existing one in place.
    pub fn insert(&mut self, record: TrackingRecord) {
        if let Some(seq) = self.index.get(&record.identifier) {
            self.rows.insert(*seq, record);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(record.identifier.clone(), seq);
        self.rows.insert(seq, record);
    }

    /// Returns the record for `identifier`.
    pub fn get(&self, identifier: &str) -> Option<&TrackingRecord> {
        self.index.get(identifier).and_then(|seq| self.rows.get(seq))
    }

    /// Returns the record for `identifier` mutably.
    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut TrackingRecord> {
        match self.index.get(identifier) {
            Some(seq) => self.rows.get_mut(seq),
            None => None,
        }
    }

    /// Returns true if `identifier` is tracked.
    pub fn contains(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier)
    }

    /// Removes and returns the record for `identifier`.
    pub fn remove(&mut self, identifier: &str) -> Option<TrackingRecord> {
        let seq = self.index.remove(identifier)?;
        self.rows.remove(&seq)
    }

    /// Iterates records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackingRecord> {
        self.rows.values()
    }

    /// Returns up to `limit` records matching `filter`, in insertion order.
    pub fn select<F>(&self, limit: usize, filter: F) -> Vec<&TrackingRecord>
    where
        F: Fn(&TrackingRecord) -> bool,
    {
        self.rows.values().filter(|r| filter(r)).take(limit).collect()
    }

    /// Returns true if any record is not `Synced`.
    pub fn has_unsynced(&self) -> bool {
        self.rows.values().any(|r| r.state != EntityState::Synced)
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no record is tracked.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use zonesync_protocol::{RecordId, ZoneId};

    fn saved(identifier: &str) -> RemoteRecord {
        let mut record = RemoteRecord::new(RecordId::new(ZoneId::new("z"), identifier), "Note");
        record.change_tag = Some("t1".into());
        record
    }

    #[test]
    fn local_lifecycle() {
        let mut record = TrackingRecord::new_local("Note.1", "Note");
        assert_eq!(record.state, EntityState::New);

        record.mark_changed(["title"]);
        assert_eq!(record.state, EntityState::New);

        record.acknowledge_upload(&saved("Note.1"), record.revision).unwrap();
        assert_eq!(record.state, EntityState::Synced);
        assert!(record.changed_keys.is_empty());
        assert!(record.encoded_record.is_some());

        record.mark_changed(["title"]);
        assert_eq!(record.state, EntityState::Changed);
        assert!(record.changed_keys.contains("title"));

        record.acknowledge_upload(&saved("Note.1"), record.revision).unwrap();
        assert_eq!(record.state, EntityState::Synced);

        assert!(record.mark_deleted());
        assert!(!record.mark_deleted());
        record.mark_changed(["title"]);
        assert_eq!(record.state, EntityState::Deleted);
    }

    #[test]
    fn edit_without_keys_keeps_synced() {
        let mut record = TrackingRecord::new_local("a", "T");
        record.mark_synced();
        record.mark_changed(Vec::<String>::new());
        assert_eq!(record.state, EntityState::Synced);
    }

    #[test]
    fn inserted_becomes_changed_on_local_edit() {
        let mut record = TrackingRecord::inserted("a", "T");
        record.mark_changed(["x"]);
        assert_eq!(record.state, EntityState::Changed);
    }

    #[test]
    fn deleted_ack_does_not_resurrect() {
        let mut record = TrackingRecord::new_local("a", "T");
        record.mark_deleted();
        record.acknowledge_upload(&saved("a"), record.revision).unwrap();
        assert_eq!(record.state, EntityState::Deleted);
    }

    #[test]
    fn stale_ack_keeps_later_edit_pending() {
        let mut record = TrackingRecord::new_local("a", "T");
        let uploaded = record.revision;
        record.mark_changed(["x"]);

        record.acknowledge_upload(&saved("a"), uploaded).unwrap();
        assert_eq!(record.state, EntityState::Changed);
        assert!(record.changed_keys.contains("x"));
        assert_eq!(record.last_known_record().unwrap(), Some(saved("a")));

        record.acknowledge_upload(&saved("a"), record.revision).unwrap();
        assert_eq!(record.state, EntityState::Synced);
    }

    #[test]
    fn repeated_edit_of_dirty_key_bumps_revision() {
        let mut record = TrackingRecord::new_local("a", "T");
        record.mark_synced();
        record.mark_changed(["x"]);
        let first = record.revision;
        record.mark_changed(["x"]);
        assert!(record.revision > first);
    }

    #[test]
    fn last_known_record_roundtrip() {
        let mut record = TrackingRecord::new_local("Note.1", "Note");
        assert_eq!(record.last_known_record().unwrap(), None);
        record.acknowledge_upload(&saved("Note.1"), record.revision).unwrap();
        assert_eq!(record.last_known_record().unwrap(), Some(saved("Note.1")));
    }

    #[test]
    fn table_keeps_insertion_order_on_replace() {
        let mut table = TrackingTable::new();
        table.insert(TrackingRecord::new_local("b", "T"));
        table.insert(TrackingRecord::new_local("a", "T"));
        table.insert(TrackingRecord::new_local("c", "T"));

        let mut replacement = TrackingRecord::new_local("a", "T");
        replacement.mark_synced();
        table.insert(replacement);

        let order: Vec<_> = table.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
        assert_eq!(table.get("a").unwrap().state, EntityState::Synced);
        assert!(table.has_unsynced());
    }

    #[test]
    fn table_select_respects_limit() {
        let table = TrackingTable::from_records(
            (0..5).map(|i| TrackingRecord::new_local(format!("r{i}"), "T")),
        );
        let picked = table.select(3, |r| r.state.needs_upload());
        let ids: Vec<_> = picked.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2"]);
    }

    proptest! {
        #[test]
        fn iteration_follows_first_insertion(ops in prop::collection::vec((0u8..6, any::<bool>()), 0..40)) {
            let mut table = TrackingTable::new();
            let mut expected: Vec<String> = Vec::new();

            for (key, remove) in ops {
                let id = format!("k{key}");
                if remove {
                    table.remove(&id);
                    expected.retain(|e| e != &id);
                } else {
                    if !expected.contains(&id) {
                        expected.push(id.clone());
                    }
                    table.insert(TrackingRecord::new_local(id, "T"));
                }
            }

            let actual: Vec<String> = table.iter().map(|r| r.identifier.clone()).collect();
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(table.len(), table.iter().count());
        }
    }
}
