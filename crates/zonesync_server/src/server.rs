//! The record service.

use crate::change_log::ChangeLog;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::zone_log::ZoneLog;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use zonesync_protocol::{
    ChangeToken, DatabaseChanges, PushOutcome, RecordId, RemoteRecord, Subscription,
    SubscriptionId, ZoneChanges, ZoneId,
};

/// In-process record service.
///
/// Lock order is zones, then the database feed, then subscriptions.
pub struct SyncServer {
    config: ServerConfig,
    zones: RwLock<BTreeMap<ZoneId, ZoneLog>>,
    database: RwLock<ChangeLog<ZoneId>>,
    subscriptions: RwLock<BTreeMap<String, Subscription>>,
    next_incarnation: AtomicU64,
    next_subscription: AtomicU64,
}

impl SyncServer {
    /// Creates an empty service.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            zones: RwLock::new(BTreeMap::new()),
            database: RwLock::new(ChangeLog::new()),
            subscriptions: RwLock::new(BTreeMap::new()),
            next_incarnation: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Creates a zone. Returns false if it already existed.
    pub fn create_zone(&self, zone: &ZoneId) -> bool {
        let mut zones = self.zones.write();
        if zones.contains_key(zone) {
            return false;
        }
        let incarnation = self.next_incarnation.fetch_add(1, Ordering::SeqCst);
        zones.insert(zone.clone(), ZoneLog::new(zone.clone(), incarnation));
        self.database.write().touch(zone.clone());
        info!(zone = %zone, "zone created");
        true
    }

    /// Deletes a zone and all of its records.
    pub fn delete_zone(&self, zone: &ZoneId) -> ServerResult<()> {
        let mut zones = self.zones.write();
        if zones.remove(zone).is_none() {
            return Err(ServerError::ZoneNotFound(zone.clone()));
        }
        self.database.write().touch(zone.clone());
        info!(zone = %zone, "zone deleted");
        Ok(())
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.zones.read().contains_key(zone)
    }

    /// Lists existing zones.
    pub fn zones(&self) -> Vec<ZoneId> {
        self.zones.read().keys().cloned().collect()
    }

    /// Returns a stored record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.zones
            .read()
            .get(&id.zone)
            .and_then(|log| log.record(&id.name).cloned())
    }

    /// Number of records stored in `zone`.
    pub fn record_count(&self, zone: &ZoneId) -> usize {
        self.zones.read().get(zone).map_or(0, ZoneLog::len)
    }

    /// Lists zones changed or deleted since `token`.
    pub fn fetch_database_changes(
        &self,
        token: Option<&ChangeToken>,
    ) -> ServerResult<DatabaseChanges> {
        let zones = self.zones.read();
        let database = self.database.read();

        let after = match token {
            None => 0,
            Some(token) => {
                let seq: u64 = token
                    .as_str()
                    .parse()
                    .map_err(|_| ServerError::InvalidToken(token.as_str().to_string()))?;
                if seq > database.last_seq() {
                    return Err(ServerError::InvalidToken(token.as_str().to_string()));
                }
                seq
            }
        };

        let page = database.since(after, self.config.max_database_page);
        let mut changes = DatabaseChanges {
            token: Some(ChangeToken::new(page.cursor.to_string())),
            more_coming: page.more_coming,
            ..DatabaseChanges::default()
        };
        for zone in page.keys {
            if zones.contains_key(&zone) {
                changes.changed_zones.push(zone);
            } else {
                changes.deleted_zones.push(zone);
            }
        }
        Ok(changes)
    }

    /// Reads one page of a zone's changes.
    pub fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> ServerResult<ZoneChanges> {
        let zones = self.zones.read();
        let log = zones
            .get(zone)
            .ok_or_else(|| ServerError::ZoneNotFound(zone.clone()))?;
        log.changes_since(token, limit.min(self.config.max_fetch_page))
    }

    /// Saves records into a zone.
    pub fn push_records(
        &self,
        zone: &ZoneId,
        records: Vec<RemoteRecord>,
    ) -> ServerResult<PushOutcome> {
        if records.len() > self.config.max_push_batch {
            return Err(ServerError::BatchTooLarge {
                size: records.len(),
                max: self.config.max_push_batch,
            });
        }

        let mut zones = self.zones.write();
        let log = zones
            .get_mut(zone)
            .ok_or_else(|| ServerError::ZoneNotFound(zone.clone()))?;
        let outcome = log.save(records);
        if !outcome.saved.is_empty() {
            self.database.write().touch(zone.clone());
        }
        debug!(
            zone = %zone,
            saved = outcome.saved.len(),
            conflicts = outcome.conflicts.len(),
            failed = outcome.failed.len(),
            "records pushed"
        );
        Ok(outcome)
    }

    /// Deletes records from a zone.
    pub fn push_deletions(&self, zone: &ZoneId, ids: Vec<RecordId>) -> ServerResult<Vec<RecordId>> {
        if ids.len() > self.config.max_delete_batch {
            return Err(ServerError::BatchTooLarge {
                size: ids.len(),
                max: self.config.max_delete_batch,
            });
        }

        let mut zones = self.zones.write();
        let log = zones
            .get_mut(zone)
            .ok_or_else(|| ServerError::ZoneNotFound(zone.clone()))?;
        let acknowledged = log.delete(ids);
        if !acknowledged.is_empty() {
            self.database.write().touch(zone.clone());
        }
        debug!(zone = %zone, deleted = acknowledged.len(), "records deleted");
        Ok(acknowledged)
    }

    /// Lists subscriptions.
    pub fn fetch_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    /// Creates a subscription for `zone`, or for the database when `None`.
    pub fn create_subscription(&self, zone: Option<&ZoneId>) -> Subscription {
        let n = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscription = Subscription {
            id: SubscriptionId::new(format!("sub-{n}")),
            zone: zone.cloned(),
        };
        self.subscriptions
            .write()
            .insert(subscription.id.as_str().to_string(), subscription.clone());
        subscription
    }

    /// Deletes a subscription. Unknown identifiers are ignored.
    pub fn delete_subscription(&self, id: &SubscriptionId) {
        self.subscriptions.write().remove(id.as_str());
    }
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("zones", &self.zones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::new("notes")
    }

    fn note(name: &str) -> RemoteRecord {
        RemoteRecord::new(RecordId::new(zone(), name), "Note").with_field("title", name)
    }

    #[test]
    fn create_zone_is_idempotent() {
        let server = SyncServer::default();
        assert!(server.create_zone(&zone()));
        assert!(!server.create_zone(&zone()));
        assert_eq!(server.zones(), vec![zone()]);
    }

    #[test]
    fn missing_zone_errors() {
        let server = SyncServer::default();
        assert_eq!(
            server.fetch_zone_changes(&zone(), None, 10),
            Err(ServerError::ZoneNotFound(zone()))
        );
        assert!(server.push_records(&zone(), vec![note("a")]).is_err());
        assert!(server.delete_zone(&zone()).is_err());
    }

    #[test]
    fn push_batch_limit() {
        let server = SyncServer::new(ServerConfig::default().with_max_push_batch(2));
        server.create_zone(&zone());
        let result = server.push_records(&zone(), vec![note("a"), note("b"), note("c")]);
        assert_eq!(result, Err(ServerError::BatchTooLarge { size: 3, max: 2 }));
        assert_eq!(server.record_count(&zone()), 0);
    }

    #[test]
    fn fetch_page_is_capped() {
        let server = SyncServer::new(ServerConfig::default().with_max_fetch_page(2));
        server.create_zone(&zone());
        server
            .push_records(&zone(), vec![note("a"), note("b"), note("c")])
            .unwrap();

        let page = server.fetch_zone_changes(&zone(), None, 100).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.more_coming);
    }

    #[test]
    fn database_feed_tracks_changed_and_deleted_zones() {
        let server = SyncServer::default();
        let other = ZoneId::new("todos");
        server.create_zone(&zone());
        server.create_zone(&other);

        let first = server.fetch_database_changes(None).unwrap();
        assert_eq!(first.changed_zones, vec![zone(), other.clone()]);

        server.push_records(&zone(), vec![note("a")]).unwrap();
        server.delete_zone(&other).unwrap();

        let second = server.fetch_database_changes(first.token.as_ref()).unwrap();
        assert_eq!(second.changed_zones, vec![zone()]);
        assert_eq!(second.deleted_zones, vec![other]);

        let third = server.fetch_database_changes(second.token.as_ref()).unwrap();
        assert!(third.is_empty());
        assert_eq!(third.token, second.token);
    }

    #[test]
    fn recreated_zone_replays_from_start() {
        let server = SyncServer::default();
        server.create_zone(&zone());
        server.push_records(&zone(), vec![note("a")]).unwrap();
        let token = server.fetch_zone_changes(&zone(), None, 10).unwrap().token;

        server.delete_zone(&zone()).unwrap();
        server.create_zone(&zone());
        server.push_records(&zone(), vec![note("b")]).unwrap();

        let page = server.fetch_zone_changes(&zone(), Some(&token), 10).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id.name, "b");
    }

    #[test]
    fn invalid_database_token() {
        let server = SyncServer::default();
        let bogus = ChangeToken::new("17");
        assert!(matches!(
            server.fetch_database_changes(Some(&bogus)),
            Err(ServerError::InvalidToken(_))
        ));
    }

    #[test]
    fn subscriptions_lifecycle() {
        let server = SyncServer::default();
        let zone_sub = server.create_subscription(Some(&zone()));
        let db_sub = server.create_subscription(None);
        assert_ne!(zone_sub.id, db_sub.id);
        assert_eq!(server.fetch_subscriptions().len(), 2);

        server.delete_subscription(&zone_sub.id);
        server.delete_subscription(&zone_sub.id);
        assert_eq!(server.fetch_subscriptions(), vec![db_sub]);
    }
}
