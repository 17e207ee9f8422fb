//! Records and change feed of a single zone.

use crate::change_log::ChangeLog;
use crate::error::{ServerError, ServerResult};
use std::collections::BTreeMap;
use tracing::debug;
use zonesync_protocol::{
    ChangeToken, FieldValue, PushFailure, PushOutcome, RecordId, RemoteRecord, ZoneChanges,
    ZoneId,
};

/// Server-side state of one zone.
///
/// Tokens have the form `<incarnation>:<sequence>`. A zone that is deleted
/// and created again gets a new incarnation, so tokens from the previous
/// incarnation restart the feed from the beginning.
#[derive(Debug, Clone)]
pub struct ZoneLog {
    zone: ZoneId,
    incarnation: u64,
    records: BTreeMap<String, RemoteRecord>,
    log: ChangeLog<String>,
}

impl ZoneLog {
    /// Creates an empty zone.
    pub fn new(zone: ZoneId, incarnation: u64) -> Self {
        Self {
            zone,
            incarnation,
            records: BTreeMap::new(),
            log: ChangeLog::new(),
        }
    }

    /// The zone this log belongs to.
    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the zone holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the stored record named `name`.
    pub fn record(&self, name: &str) -> Option<&RemoteRecord> {
        self.records.get(name)
    }

    /// Token pointing at the current end of the feed.
    pub fn current_token(&self) -> ChangeToken {
        self.token_at(self.log.last_seq())
    }

    /// Reads up to `limit` changes after `token`.
    pub fn changes_since(
        &self,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> ServerResult<ZoneChanges> {
        let after = self.parse_token(token)?;
        let page = self.log.since(after, limit);

        let mut changes = ZoneChanges::empty(self.zone.clone(), self.token_at(page.cursor));
        changes.more_coming = page.more_coming;
        for name in page.keys {
            match self.records.get(&name) {
                Some(record) => changes.records.push(record.clone()),
                None => changes.deleted.push(RecordId::new(self.zone.clone(), name)),
            }
        }
        Ok(changes)
    }

    /// Saves records, merging fields into what is stored.
    ///
    /// A record whose change tag does not match the stored one is reported
    /// as a conflict carrying the stored version. `Null` fields remove the
    /// stored value.
    pub fn save(&mut self, records: Vec<RemoteRecord>) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        for record in records {
            if record.id.zone != self.zone {
                outcome.failed.push(PushFailure {
                    reason: format!("record belongs to zone {}", record.id.zone),
                    id: record.id,
                });
                continue;
            }

            let name = record.id.name.clone();
            if let Some(current) = self.records.get(&name) {
                if current.change_tag != record.change_tag {
                    debug!(zone = %self.zone, record = %name, "change tag mismatch");
                    outcome.conflicts.push(current.clone());
                    continue;
                }
            }

            let mut stored = self
                .records
                .remove(&name)
                .unwrap_or_else(|| RemoteRecord::new(record.id.clone(), record.record_type.clone()));
            stored.record_type = record.record_type;
            for (key, value) in record.fields {
                match value {
                    FieldValue::Null => {
                        stored.remove_field(&key);
                    }
                    value => stored.set_field(key, value),
                }
            }

            let seq = self.log.touch(name.clone());
            stored.change_tag = Some(format!("{}-{}", self.incarnation, seq));
            self.records.insert(name, stored.clone());
            outcome.saved.push(stored);
        }
        outcome
    }

    /// Deletes records. Unknown identifiers are acknowledged as well.
    pub fn delete(&mut self, ids: Vec<RecordId>) -> Vec<RecordId> {
        let mut acknowledged = Vec::with_capacity(ids.len());
        for id in ids {
            if id.zone != self.zone {
                continue;
            }
            if self.records.remove(&id.name).is_some() {
                self.log.touch(id.name.clone());
            }
            acknowledged.push(id);
        }
        acknowledged
    }

    fn token_at(&self, seq: u64) -> ChangeToken {
        ChangeToken::new(format!("{}:{}", self.incarnation, seq))
    }

    fn parse_token(&self, token: Option<&ChangeToken>) -> ServerResult<u64> {
        let Some(token) = token else {
            return Ok(0);
        };
        let invalid = || ServerError::InvalidToken(token.as_str().to_string());
        let (incarnation, seq) = token.as_str().split_once(':').ok_or_else(invalid)?;
        let incarnation: u64 = incarnation.parse().map_err(|_| invalid())?;
        let seq: u64 = seq.parse().map_err(|_| invalid())?;

        if incarnation != self.incarnation {
            return Ok(0);
        }
        if seq > self.log.last_seq() {
            return Err(invalid());
        }
        Ok(seq)
    }
}
