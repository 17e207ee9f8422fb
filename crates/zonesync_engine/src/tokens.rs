//! Change-token store.
//!
//! Namespaces engine and per-zone bookkeeping inside a [`KeyValueStore`]:
//! the device identifier, the database token, zone tokens and subscription
//! ids. Tokens are only written after the changes they cover are durable.

use crate::error::SyncResult;
use crate::kv::KeyValueStore;
use std::sync::Arc;
use uuid::Uuid;
use zonesync_protocol::{ChangeToken, SubscriptionId, ZoneId};

/// Engine-level view of the key-value store.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl TokenStore {
    /// Creates a token store whose keys are prefixed with `namespace`.
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}.{}", self.namespace, suffix)
    }

    fn zone_key(&self, zone: &ZoneId, suffix: &str) -> String {
        format!("{}.zone.{}.{}", self.namespace, zone.name(), suffix)
    }

    /// Returns this device's identifier, generating and persisting one on first use.
    pub fn device_id(&self) -> SyncResult<String> {
        let key = self.key("deviceId");
        if let Some(id) = self.kv.string(&key)? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.kv.set_string(&key, &id)?;
        Ok(id)
    }

    /// Forgets the device identifier; a new one is generated on next use.
    pub fn clear_device_id(&self) -> SyncResult<()> {
        self.kv.remove(&self.key("deviceId"))
    }

    /// Returns the database change-feed token.
    pub fn database_token(&self) -> SyncResult<Option<ChangeToken>> {
        Ok(self
            .kv
            .string(&self.key("databaseToken"))?
            .map(ChangeToken::new))
    }

    /// Stores or clears the database change-feed token.
    pub fn set_database_token(&self, token: Option<&ChangeToken>) -> SyncResult<()> {
        let key = self.key("databaseToken");
        match token {
            Some(token) => self.kv.set_string(&key, token.as_str()),
            None => self.kv.remove(&key),
        }
    }

    /// Returns the push batch size remembered from earlier cycles.
    pub fn batch_size(&self) -> SyncResult<Option<usize>> {
        Ok(self
            .kv
            .string(&self.key("batchSize"))?
            .and_then(|value| value.parse().ok()))
    }

    /// Remembers or forgets the adapted push batch size.
    pub fn set_batch_size(&self, size: Option<usize>) -> SyncResult<()> {
        let key = self.key("batchSize");
        match size {
            Some(size) => self.kv.set_string(&key, &size.to_string()),
            None => self.kv.remove(&key),
        }
    }

    /// Returns the token handle scoped to `zone`.
    pub fn zone(&self, zone: &ZoneId) -> ZoneTokens {
        ZoneTokens {
            kv: Arc::clone(&self.kv),
            key: self.zone_key(zone, "token"),
        }
    }

    /// Returns the stored database subscription id.
    pub fn database_subscription(&self) -> SyncResult<Option<SubscriptionId>> {
        Ok(self
            .kv
            .string(&self.key("databaseSubscription"))?
            .map(SubscriptionId::new))
    }

    /// Stores or clears the database subscription id.
    pub fn set_database_subscription(&self, id: Option<&SubscriptionId>) -> SyncResult<()> {
        let key = self.key("databaseSubscription");
        match id {
            Some(id) => self.kv.set_string(&key, id.as_str()),
            None => self.kv.remove(&key),
        }
    }

    /// Returns the stored subscription id for `zone`.
    pub fn zone_subscription(&self, zone: &ZoneId) -> SyncResult<Option<SubscriptionId>> {
        Ok(self
            .kv
            .string(&self.zone_key(zone, "subscription"))?
            .map(SubscriptionId::new))
    }

    /// Stores or clears the subscription id for `zone`.
    pub fn set_zone_subscription(
        &self,
        zone: &ZoneId,
        id: Option<&SubscriptionId>,
    ) -> SyncResult<()> {
        let key = self.zone_key(zone, "subscription");
        match id {
            Some(id) => self.kv.set_string(&key, id.as_str()),
            None => self.kv.remove(&key),
        }
    }

    /// Removes every key belonging to `zone`.
    pub fn clear_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        self.kv.remove(&self.zone_key(zone, "token"))?;
        self.kv.remove(&self.zone_key(zone, "subscription"))
    }
}

/// Change token of a single zone.
#[derive(Clone)]
pub struct ZoneTokens {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl ZoneTokens {
    /// Returns the stored token.
    pub fn token(&self) -> SyncResult<Option<ChangeToken>> {
        Ok(self.kv.string(&self.key)?.map(ChangeToken::new))
    }

    /// Stores or clears the token.
    pub fn save(&self, token: Option<&ChangeToken>) -> SyncResult<()> {
        match token {
            Some(token) => self.kv.set_string(&self.key, token.as_str()),
            None => self.kv.remove(&self.key),
        }
    }
}

impl std::fmt::Debug for ZoneTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneTokens").field("key", &self.key).finish()
    }
}
