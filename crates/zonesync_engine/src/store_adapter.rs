//! Reference [`ModelAdapter`] over an [`ObjectStore`].
//!
//! Imports are staged in memory between `begin_import` and `commit_import`.
//! A commit writes the staged object batch, then the tracking snapshot; if
//! the snapshot cannot be saved the object batch is undone, so a failed
//! commit leaves both stores as they were.
//!
//! Local mutations (`insert_object`, `update_fields`, `delete_object`) write
//! through immediately and drive the tracking state machine.

use crate::adapter::{ConflictDelegate, FieldConflict, ModelAdapter};
use crate::error::{SyncError, SyncResult};
use crate::object_store::{LocalObject, ObjectStore, ObjectWrite};
use crate::pending::{PendingRelationship, RelationshipLedger};
use crate::state_store::{StateStore, TrackingSnapshot};
use crate::tokens::ZoneTokens;
use crate::tracking::{EntityState, TrackingRecord, TrackingTable};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use zonesync_protocol::{
    ChangeToken, FieldChanges, FieldMap, FieldValue, MergePolicy, RecordId, RemoteRecord, ZoneId,
};

/// Adapter bridging one zone to an [`ObjectStore`] and a [`StateStore`].
pub struct ObjectStoreAdapter {
    zone: ZoneId,
    objects: Arc<dyn ObjectStore>,
    state_store: Arc<dyn StateStore>,
    tokens: ZoneTokens,
    policy: RwLock<MergePolicy>,
    delegate: RwLock<Option<Arc<dyn ConflictDelegate>>>,
    state: Mutex<AdapterState>,
}

#[derive(Default)]
struct AdapterState {
    tracking: TrackingTable,
    ledger: RelationshipLedger,
    batch: Option<ImportBatch>,
    /// Revision of each record as last handed out for upload.
    in_flight: HashMap<String, u64>,
}

/// Work accumulated since the last commit.
struct ImportBatch {
    committed_tracking: TrackingTable,
    committed_ledger: RelationshipLedger,
    writes: BTreeMap<String, Option<LocalObject>>,
}

/// Outcome of looking up the targets of an incoming record's references.
#[derive(Default)]
struct ReferencePlan {
    linked: Vec<(String, String)>,
    pending: Vec<(String, String)>,
}

impl AdapterState {
    fn object(&self, objects: &dyn ObjectStore, identifier: &str) -> SyncResult<Option<LocalObject>> {
        if let Some(staged) = self
            .batch
            .as_ref()
            .and_then(|batch| batch.writes.get(identifier))
        {
            return Ok(staged.clone());
        }
        objects.get(identifier)
    }

    fn stage(&mut self, write: ObjectWrite) -> SyncResult<()> {
        let batch = self.batch.as_mut().ok_or(SyncError::NoImportBatch)?;
        match write {
            ObjectWrite::Put(object) => {
                batch.writes.insert(object.identifier.clone(), Some(object));
            }
            ObjectWrite::Delete(identifier) => {
                batch.writes.insert(identifier, None);
            }
        }
        Ok(())
    }

    fn require_batch(&self) -> SyncResult<()> {
        match self.batch {
            Some(_) => Ok(()),
            None => Err(SyncError::NoImportBatch),
        }
    }

    fn snapshot(&self) -> TrackingSnapshot {
        TrackingSnapshot {
            records: self.tracking.iter().cloned().collect(),
            edges: self.ledger.iter().cloned().collect(),
        }
    }

    /// Snapshot of what has been committed, ignoring an open batch.
    fn committed_snapshot(&self) -> TrackingSnapshot {
        match &self.batch {
            Some(batch) => TrackingSnapshot {
                records: batch.committed_tracking.iter().cloned().collect(),
                edges: batch.committed_ledger.iter().cloned().collect(),
            },
            None => self.snapshot(),
        }
    }

    /// Applies a local mutation to the working view and to the committed
    /// view of an open import batch.
    fn apply_local<F>(&mut self, mut f: F) -> SyncResult<()>
    where
        F: FnMut(&mut TrackingTable, &mut RelationshipLedger) -> SyncResult<()>,
    {
        f(&mut self.tracking, &mut self.ledger)?;
        if let Some(batch) = self.batch.as_mut() {
            f(&mut batch.committed_tracking, &mut batch.committed_ledger)?;
        }
        Ok(())
    }
}

impl ObjectStoreAdapter {
    /// Opens an adapter, loading any previously saved tracking snapshot.
    pub fn open(
        zone: ZoneId,
        objects: Arc<dyn ObjectStore>,
        state_store: Arc<dyn StateStore>,
        tokens: ZoneTokens,
    ) -> SyncResult<Self> {
        let snapshot = state_store.load()?.unwrap_or_default();
        debug!(
            zone = %zone,
            records = snapshot.records.len(),
            edges = snapshot.edges.len(),
            "opened adapter"
        );
        let state = AdapterState {
            tracking: TrackingTable::from_records(snapshot.records),
            ledger: RelationshipLedger::from_edges(snapshot.edges),
            batch: None,
            in_flight: HashMap::new(),
        };
        Ok(Self {
            zone,
            objects,
            state_store,
            tokens,
            policy: RwLock::new(MergePolicy::default()),
            delegate: RwLock::new(None),
            state: Mutex::new(state),
        })
    }

    /// Sets the merge policy (builder style).
    pub fn with_merge_policy(self, policy: MergePolicy) -> Self {
        *self.policy.write() = policy;
        self
    }

    /// Sets the conflict delegate used by [`MergePolicy::Custom`] (builder style).
    pub fn with_conflict_delegate(self, delegate: Arc<dyn ConflictDelegate>) -> Self {
        self.set_conflict_delegate(Some(delegate));
        self
    }

    /// Replaces or removes the conflict delegate.
    pub fn set_conflict_delegate(&self, delegate: Option<Arc<dyn ConflictDelegate>>) {
        *self.delegate.write() = delegate;
    }

    /// Reads a committed object.
    pub fn object(&self, identifier: &str) -> SyncResult<Option<LocalObject>> {
        self.objects.get(identifier)
    }

    /// Returns the tracking record of an object.
    pub fn tracking_record(&self, identifier: &str) -> Option<TrackingRecord> {
        self.state.lock().tracking.get(identifier).cloned()
    }

    /// Returns every tracking record in insertion order.
    pub fn tracking_records(&self) -> Vec<TrackingRecord> {
        self.state.lock().tracking.iter().cloned().collect()
    }

    /// Returns every pending relationship edge.
    pub fn pending_relationships(&self) -> Vec<PendingRelationship> {
        self.state.lock().ledger.iter().cloned().collect()
    }

    /// Creates an object locally.
    ///
    /// Inserting over an existing object records every field as changed.
    pub fn insert_object(&self, object: LocalObject) -> SyncResult<()> {
        let mut state = self.state.lock();
        let identifier = object.identifier.clone();
        let entity_type = object.entity_type.clone();
        let keys: Vec<String> = object.fields.keys().cloned().collect();

        self.objects.apply(vec![ObjectWrite::Put(object)])?;
        state.apply_local(|tracking, ledger| {
            ledger.remove_owned_by(&identifier);
            match tracking.get_mut(&identifier) {
                Some(record) if record.state == EntityState::Deleted => {
                    record.reopen(keys.iter().cloned());
                }
                Some(record) => record.mark_changed(keys.iter().cloned()),
                None => tracking.insert(TrackingRecord::new_local(&identifier, &entity_type)),
            }
            Ok(())
        })?;

        // An open import links waiting edges when it finishes.
        if state.batch.is_none() {
            self.link_committed(&mut state, &identifier)?;
        }
        self.state_store.save(&state.committed_snapshot())
    }

    /// Updates fields of a local object. A `Null` value removes the field.
    pub fn update_fields(&self, identifier: &str, fields: FieldMap) -> SyncResult<()> {
        let mut state = self.state.lock();
        let mut object = self
            .objects
            .get(identifier)?
            .ok_or_else(|| SyncError::UnknownObject(identifier.to_string()))?;

        let mut changed = Vec::new();
        for (name, value) in fields {
            if value.is_null() {
                if object.fields.remove(&name).is_some() {
                    changed.push(name);
                }
            } else if object.fields.get(&name) != Some(&value) {
                object.fields.insert(name.clone(), value);
                changed.push(name);
            }
        }
        if changed.is_empty() {
            return Ok(());
        }

        let entity_type = object.entity_type.clone();
        self.objects.apply(vec![ObjectWrite::Put(object)])?;
        state.apply_local(|tracking, ledger| {
            for name in &changed {
                ledger.remove_field(identifier, name);
            }
            match tracking.get_mut(identifier) {
                Some(record) => record.mark_changed(changed.iter().cloned()),
                None => tracking.insert(TrackingRecord::new_local(identifier, &entity_type)),
            }
            Ok(())
        })?;
        self.state_store.save(&state.committed_snapshot())
    }

    /// Deletes a local object and schedules its remote deletion.
    ///
    /// An object that was never uploaded is forgotten outright.
    pub fn delete_object(&self, identifier: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !self.objects.contains(identifier)? && !state.tracking.contains(identifier) {
            return Err(SyncError::UnknownObject(identifier.to_string()));
        }

        self.objects
            .apply(vec![ObjectWrite::Delete(identifier.to_string())])?;
        state.apply_local(|tracking, ledger| {
            ledger.remove_owned_by(identifier);
            match tracking.get(identifier).map(|record| record.state) {
                Some(EntityState::New) => {
                    tracking.remove(identifier);
                }
                Some(_) => {
                    if let Some(record) = tracking.get_mut(identifier) {
                        record.mark_deleted();
                    }
                }
                None => {}
            }
            Ok(())
        })?;
        self.state_store.save(&state.committed_snapshot())
    }

    /// Links committed objects waiting on `target` outside an import.
    fn link_committed(&self, state: &mut AdapterState, target: &str) -> SyncResult<usize> {
        let edges = state.ledger.take_for_target(target);
        let mut linked = 0;
        for edge in edges {
            let Some(mut owner) = self.objects.get(&edge.owner)? else {
                continue;
            };
            owner
                .fields
                .insert(edge.name.clone(), FieldValue::Reference(target.to_string()));
            self.objects.apply(vec![ObjectWrite::Put(owner)])?;
            linked += 1;
            let still_pending = state.ledger.has_pending_for(&edge.owner);
            if let Some(record) = state.tracking.get_mut(&edge.owner) {
                if record.state == EntityState::Inserted && !still_pending {
                    record.mark_synced();
                }
            }
        }
        Ok(linked)
    }

    /// Links committed edges whose target was stored while an import was open.
    fn link_arrived(&self, state: &mut AdapterState) -> SyncResult<usize> {
        let mut linked = 0;
        for target in state.ledger.targets() {
            if self.objects.contains(&target)? {
                linked += self.link_committed(state, &target)?;
            }
        }
        if linked > 0 {
            self.state_store.save(&state.snapshot())?;
        }
        Ok(linked)
    }

    /// Links staged or committed objects waiting on `target`.
    fn link_waiting(&self, state: &mut AdapterState, target: &str) -> SyncResult<usize> {
        let edges = state.ledger.take_for_target(target);
        let mut linked = 0;
        for edge in edges {
            let Some(mut owner) = state.object(&*self.objects, &edge.owner)? else {
                continue;
            };
            owner
                .fields
                .insert(edge.name.clone(), FieldValue::Reference(target.to_string()));
            state.stage(ObjectWrite::Put(owner))?;
            linked += 1;

            let still_pending = state.ledger.has_pending_for(&edge.owner);
            if let Some(record) = state.tracking.get_mut(&edge.owner) {
                if record.state == EntityState::Inserted && !still_pending {
                    record.mark_synced();
                }
            }
        }
        Ok(linked)
    }

    fn plan_references(
        &self,
        state: &AdapterState,
        record: &RemoteRecord,
    ) -> SyncResult<ReferencePlan> {
        let mut plan = ReferencePlan::default();
        for (name, value) in &record.fields {
            let Some(target) = value.as_reference() else {
                continue;
            };
            if state.object(&*self.objects, target)?.is_some() {
                plan.linked.push((name.clone(), target.to_string()));
            } else {
                plan.pending.push((name.clone(), target.to_string()));
            }
        }
        Ok(plan)
    }

    /// Replaces the owner's relationship edges with the plan's pending ones
    /// and returns the linked reference fields.
    fn apply_plan(state: &mut AdapterState, owner: &str, plan: ReferencePlan) -> FieldMap {
        state.ledger.remove_owned_by(owner);
        for (name, target) in plan.pending {
            state.ledger.add(owner, name, target);
        }
        plan.linked
            .into_iter()
            .map(|(name, target)| (name, FieldValue::Reference(target)))
            .collect()
    }

    /// Marks a record synced unless it still waits on a relationship.
    fn settle(state: &mut AdapterState, mut tracking: TrackingRecord) {
        let waiting = state.ledger.has_pending_for(&tracking.identifier);
        if !(tracking.state == EntityState::Inserted && waiting) {
            tracking.mark_synced();
        }
        state.tracking.insert(tracking);
    }

    fn apply_record(
        &self,
        state: &mut AdapterState,
        record: &RemoteRecord,
        policy: MergePolicy,
        delegate: Option<&dyn ConflictDelegate>,
    ) -> SyncResult<()> {
        let identifier = record.id.name.as_str();
        let encoded = record.encode()?;

        let Some(mut tracking) = state.tracking.get(identifier).cloned() else {
            return self.import_new(state, record, encoded);
        };
        if tracking.state == EntityState::Deleted {
            debug!(zone = %self.zone, identifier, "local deletion pending, incoming change ignored");
            return Ok(());
        }

        let local = state
            .object(&*self.objects, identifier)?
            .unwrap_or_else(|| LocalObject::new(identifier, &record.record_type));
        let policy = if tracking.state.needs_upload() {
            policy
        } else {
            MergePolicy::ServerWins
        };

        match policy {
            MergePolicy::ClientWins => {
                debug!(zone = %self.zone, identifier, "client wins, incoming fields discarded");
                tracking.encoded_record = Some(encoded);
                state.tracking.insert(tracking);
                Ok(())
            }
            MergePolicy::ServerWins => {
                self.apply_server_version(state, local, record, tracking, encoded)
            }
            MergePolicy::Custom => {
                let changes = FieldChanges::between(&local.fields, &record.fields, |_| false);
                let chosen = match delegate {
                    Some(delegate) => {
                        match delegate.resolve(&FieldConflict {
                            identifier,
                            entity_type: &local.entity_type,
                            local: &local.fields,
                            changes: &changes,
                        }) {
                            Ok(chosen) => Some(chosen),
                            Err(e) => {
                                warn!(zone = %self.zone, identifier, error = %e, "conflict delegate failed, server wins");
                                None
                            }
                        }
                    }
                    None => {
                        warn!(zone = %self.zone, identifier, "custom merge policy without a delegate, server wins");
                        None
                    }
                };
                match chosen {
                    Some(chosen) => {
                        self.apply_custom(state, local, record, tracking, encoded, &changes, chosen)
                    }
                    None => self.apply_server_version(state, local, record, tracking, encoded),
                }
            }
        }
    }

    fn import_new(
        &self,
        state: &mut AdapterState,
        record: &RemoteRecord,
        encoded: Vec<u8>,
    ) -> SyncResult<()> {
        let identifier = record.id.name.clone();
        let plan = self.plan_references(state, record)?;

        let mut object = LocalObject {
            identifier: identifier.clone(),
            entity_type: record.record_type.clone(),
            fields: plain_fields(&record.fields),
        };
        object
            .fields
            .extend(Self::apply_plan(state, &identifier, plan));

        let mut tracking = TrackingRecord::inserted(&identifier, &record.record_type);
        tracking.encoded_record = Some(encoded);

        state.stage(ObjectWrite::Put(object))?;
        Self::settle(state, tracking);
        debug!(zone = %self.zone, identifier = %identifier, "imported new object");

        self.link_waiting(state, &identifier)?;
        Ok(())
    }

    fn apply_server_version(
        &self,
        state: &mut AdapterState,
        local: LocalObject,
        record: &RemoteRecord,
        mut tracking: TrackingRecord,
        encoded: Vec<u8>,
    ) -> SyncResult<()> {
        let plan = self.plan_references(state, record)?;
        let mut object = LocalObject {
            identifier: local.identifier,
            entity_type: record.record_type.clone(),
            fields: plain_fields(&record.fields),
        };
        object
            .fields
            .extend(Self::apply_plan(state, &object.identifier, plan));

        tracking.encoded_record = Some(encoded);
        state.stage(ObjectWrite::Put(object))?;
        Self::settle(state, tracking);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_custom(
        &self,
        state: &mut AdapterState,
        local: LocalObject,
        record: &RemoteRecord,
        mut tracking: TrackingRecord,
        encoded: Vec<u8>,
        changes: &FieldChanges,
        chosen: FieldMap,
    ) -> SyncResult<()> {
        let plan = self.plan_references(state, record)?;

        let mut fields: FieldMap = local
            .fields
            .into_iter()
            .filter(|(_, value)| value.as_reference().is_none())
            .collect();
        for (name, incoming) in &changes.changes {
            let value = chosen.get(name).unwrap_or(incoming);
            set_or_clear(&mut fields, name, value);
        }
        for (name, value) in &chosen {
            if !changes.changes.contains_key(name) && value.as_reference().is_none() {
                set_or_clear(&mut fields, name, value);
            }
        }

        let server = plain_fields(&record.fields);
        let dirty: BTreeSet<String> = fields
            .keys()
            .chain(server.keys())
            .filter(|name| fields.get(*name) != server.get(*name))
            .cloned()
            .collect();

        let identifier = local.identifier;
        fields.extend(Self::apply_plan(state, &identifier, plan));
        state.stage(ObjectWrite::Put(LocalObject {
            identifier,
            entity_type: local.entity_type,
            fields,
        }))?;

        tracking.encoded_record = Some(encoded);
        if dirty.is_empty() {
            Self::settle(state, tracking);
        } else {
            debug!(zone = %self.zone, identifier = %tracking.identifier, kept = dirty.len(), "delegate kept local values");
            tracking.changed_keys = dirty;
            if tracking.state != EntityState::New {
                tracking.state = EntityState::Changed;
            }
            state.tracking.insert(tracking);
        }
        Ok(())
    }

    /// Writes staged objects then the snapshot, undoing the objects if the
    /// snapshot cannot be saved.
    fn persist(&self, state: &AdapterState, writes: Vec<ObjectWrite>) -> SyncResult<()> {
        let mut undo = Vec::with_capacity(writes.len());
        for write in &writes {
            undo.push(match self.objects.get(write.identifier())? {
                Some(previous) => ObjectWrite::Put(previous),
                None => ObjectWrite::Delete(write.identifier().to_string()),
            });
        }

        self.objects.apply(writes)?;
        if let Err(e) = self.state_store.save(&state.snapshot()) {
            if let Err(undo_error) = self.objects.apply(undo) {
                warn!(zone = %self.zone, error = %undo_error, "failed to undo object batch");
            }
            return Err(e);
        }
        Ok(())
    }

    fn outgoing_record(
        &self,
        tracking: &TrackingRecord,
        object: &LocalObject,
    ) -> SyncResult<RemoteRecord> {
        let known = tracking.last_known_record()?;
        let mut record = match &known {
            Some(known) => known.system_fields(),
            None => RemoteRecord::new(
                RecordId::new(self.zone.clone(), tracking.identifier.clone()),
                object.entity_type.clone(),
            ),
        };

        if tracking.state == EntityState::Changed && known.is_some() {
            for key in &tracking.changed_keys {
                let value = object.fields.get(key).cloned().unwrap_or(FieldValue::Null);
                record.set_field(key.clone(), value);
            }
        } else {
            record.fields = object.fields.clone();
        }
        Ok(record)
    }
}

/// Non-null, non-reference fields of an incoming record.
fn plain_fields(fields: &FieldMap) -> FieldMap {
    fields
        .iter()
        .filter(|(_, value)| !value.is_null() && value.as_reference().is_none())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn set_or_clear(fields: &mut FieldMap, name: &str, value: &FieldValue) {
    if value.is_null() {
        fields.remove(name);
    } else {
        fields.insert(name.to_string(), value.clone());
    }
}

impl ModelAdapter for ObjectStoreAdapter {
    fn zone(&self) -> &ZoneId {
        &self.zone
    }

    fn has_pending_local_changes(&self) -> SyncResult<bool> {
        Ok(self.state.lock().tracking.has_unsynced())
    }

    fn begin_import(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.batch.is_none() {
            let batch = ImportBatch {
                committed_tracking: state.tracking.clone(),
                committed_ledger: state.ledger.clone(),
                writes: BTreeMap::new(),
            };
            state.batch = Some(batch);
            debug!(zone = %self.zone, "import batch opened");
        }
        Ok(())
    }

    fn apply_remote_changes(&self, records: &[RemoteRecord]) -> SyncResult<()> {
        let policy = self.merge_policy();
        let delegate = self.delegate.read().clone();
        let mut state = self.state.lock();
        state.require_batch()?;

        for record in records {
            self.apply_record(&mut state, record, policy, delegate.as_deref())?;
        }
        Ok(())
    }

    fn apply_remote_deletions(&self, ids: &[RecordId]) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.require_batch()?;

        for id in ids {
            if state.tracking.remove(&id.name).is_none() {
                continue;
            }
            state.ledger.remove_owned_by(&id.name);
            state.stage(ObjectWrite::Delete(id.name.clone()))?;
        }
        Ok(())
    }

    fn resolve_pending_relationships(&self) -> SyncResult<usize> {
        let mut state = self.state.lock();
        state.require_batch()?;

        let mut linked = 0;
        for target in state.ledger.targets() {
            if state.object(&*self.objects, &target)?.is_some() {
                linked += self.link_waiting(&mut state, &target)?;
            }
        }
        if linked > 0 {
            debug!(zone = %self.zone, linked, "resolved pending relationships");
        }
        Ok(linked)
    }

    fn commit_import(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        let mut batch = state.batch.take().ok_or(SyncError::NoImportBatch)?;

        let writes: Vec<ObjectWrite> = std::mem::take(&mut batch.writes)
            .into_iter()
            .map(|(identifier, object)| match object {
                Some(object) => ObjectWrite::Put(object),
                None => ObjectWrite::Delete(identifier),
            })
            .collect();
        let count = writes.len();

        let result = self.persist(&state, writes);
        match &result {
            Ok(()) => {
                batch.committed_tracking = state.tracking.clone();
                batch.committed_ledger = state.ledger.clone();
                debug!(zone = %self.zone, writes = count, "import committed");
            }
            Err(e) => {
                state.tracking = batch.committed_tracking.clone();
                state.ledger = batch.committed_ledger.clone();
                warn!(zone = %self.zone, error = %e, "import commit failed, batch discarded");
            }
        }
        state.batch = Some(batch);
        result
    }

    fn finish_import(&self, error: Option<&SyncError>) {
        let mut state = self.state.lock();
        if let Some(batch) = state.batch.take() {
            if !batch.writes.is_empty() {
                debug!(zone = %self.zone, discarded = batch.writes.len(), "uncommitted import discarded");
            }
            state.tracking = batch.committed_tracking;
            state.ledger = batch.committed_ledger;
        }
        match self.link_arrived(&mut state) {
            Ok(0) => {}
            Ok(linked) => debug!(zone = %self.zone, linked, "linked relationships after import"),
            Err(e) => warn!(zone = %self.zone, error = %e, "failed to link relationships after import"),
        }
        if let Some(error) = error {
            debug!(zone = %self.zone, error = %error, "import finished with error");
        }
    }

    fn changes_to_upload(&self, limit: usize) -> SyncResult<Vec<RemoteRecord>> {
        let pending: Vec<TrackingRecord> = {
            let mut state = self.state.lock();
            let pending: Vec<TrackingRecord> = state
                .tracking
                .select(limit, |record| record.state.needs_upload())
                .into_iter()
                .cloned()
                .collect();
            for record in &pending {
                state
                    .in_flight
                    .insert(record.identifier.clone(), record.revision);
            }
            pending
        };

        let mut records = Vec::with_capacity(pending.len());
        for tracking in &pending {
            match self.objects.get(&tracking.identifier)? {
                Some(object) => records.push(self.outgoing_record(tracking, &object)?),
                None => {
                    warn!(zone = %self.zone, identifier = %tracking.identifier, "tracked object missing from store")
                }
            }
        }
        Ok(records)
    }

    fn acknowledge_uploaded(&self, saved: &[RemoteRecord]) -> SyncResult<()> {
        let mut state = self.state.lock();
        let uploaded: Vec<Option<u64>> = saved
            .iter()
            .map(|record| state.in_flight.remove(&record.id.name))
            .collect();
        state.apply_local(|tracking, _| {
            for (record, uploaded) in saved.iter().zip(&uploaded) {
                if let Some(row) = tracking.get_mut(&record.id.name) {
                    let uploaded = uploaded.unwrap_or(row.revision);
                    row.acknowledge_upload(record, uploaded)?;
                }
            }
            Ok(())
        })?;
        self.state_store.save(&state.committed_snapshot())
    }

    fn deletions_to_upload(&self, limit: usize) -> SyncResult<Vec<RecordId>> {
        let state = self.state.lock();
        Ok(state
            .tracking
            .select(limit, |record| record.state == EntityState::Deleted)
            .into_iter()
            .map(|record| RecordId::new(self.zone.clone(), record.identifier.clone()))
            .collect())
    }

    fn acknowledge_deleted(&self, ids: &[RecordId]) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.apply_local(|tracking, _| {
            for id in ids {
                if tracking.get(&id.name).map(|r| r.state) == Some(EntityState::Deleted) {
                    tracking.remove(&id.name);
                }
            }
            Ok(())
        })?;
        self.state_store.save(&state.committed_snapshot())
    }

    fn has_local_object(&self, identifier: &str) -> SyncResult<bool> {
        self.objects.contains(identifier)
    }

    fn reset_all_tracking(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        *state = AdapterState::default();
        self.state_store.clear()?;
        self.tokens.save(None)?;
        debug!(zone = %self.zone, "tracking reset");
        Ok(())
    }

    fn server_change_token(&self) -> SyncResult<Option<ChangeToken>> {
        self.tokens.token()
    }

    fn save_token(&self, token: Option<&ChangeToken>) -> SyncResult<()> {
        self.tokens.save(token)
    }

    fn merge_policy(&self) -> MergePolicy {
        *self.policy.read()
    }

    fn set_merge_policy(&self, policy: MergePolicy) {
        *self.policy.write() = policy;
    }
}

impl std::fmt::Debug for ObjectStoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreAdapter")
            .field("zone", &self.zone)
            .field("policy", &self.merge_policy())
            .finish()
    }
}
