//! Zone registry.
//!
//! Maps zone identifiers to the adapter that owns each zone. Adapters for
//! zones discovered remotely come from an [`AdapterProvider`].

use crate::adapter::ModelAdapter;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use zonesync_protocol::ZoneId;

/// Supplies adapters for zones the engine discovers remotely.
pub trait AdapterProvider: Send + Sync {
    /// Returns an adapter for a zone with none registered, or `None` to skip it.
    fn adapter_for_zone(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>>;

    /// Called after a remote zone deletion wiped the zone's adapter.
    fn zone_was_deleted(&self, zone: &ZoneId);
}

/// At most one adapter per zone.
#[derive(Default)]
pub struct ZoneRegistry {
    adapters: RwLock<BTreeMap<ZoneId, Arc<dyn ModelAdapter>>>,
}

impl ZoneRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its zone.
    pub fn register(&self, adapter: Arc<dyn ModelAdapter>) -> SyncResult<()> {
        let zone = adapter.zone().clone();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&zone) {
            return Err(SyncError::DuplicateAdapter(zone));
        }
        adapters.insert(zone, adapter);
        Ok(())
    }

    /// Removes and returns the adapter of `zone`.
    pub fn remove(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>> {
        self.adapters.write().remove(zone)
    }

    /// Returns the adapter of `zone`.
    pub fn get(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>> {
        self.adapters.read().get(zone).cloned()
    }

    /// Returns true if `zone` has an adapter.
    pub fn contains(&self, zone: &ZoneId) -> bool {
        self.adapters.read().contains_key(zone)
    }

    /// Returns every adapter, ordered by zone.
    pub fn adapters(&self) -> Vec<Arc<dyn ModelAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    /// Returns every registered zone.
    pub fn zones(&self) -> Vec<ZoneId> {
        self.adapters.read().keys().cloned().collect()
    }

    /// Returns the number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Returns true if no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

impl std::fmt::Debug for ZoneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneRegistry")
            .field("zones", &self.zones())
            .finish()
    }
}
