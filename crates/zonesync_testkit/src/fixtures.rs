//! Devices, zones and stores for tests.

use crate::remote::ServerRemote;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use zonesync_engine::{
    AdapterProvider, KeyValueStore, LocalObject, MemoryKeyValueStore, MemoryObjectStore,
    MemoryStateStore, ModelAdapter, ObjectStore, ObjectStoreAdapter, RetryConfig, StateStore,
    SyncConfig, SyncEngine, SyncError, SyncResult, TokenStore, TrackingSnapshot,
};
use zonesync_protocol::{FieldMap, ZoneId};

/// Installs a `tracing` subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine configuration with millisecond retries, for tests.
pub fn test_config(identifier: &str) -> SyncConfig {
    SyncConfig::new(identifier).with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false),
    )
}

/// State store that starts failing after a number of successful saves.
#[derive(Default)]
pub struct FailingStateStore {
    inner: MemoryStateStore,
    saves_left: Mutex<Option<usize>>,
    saves: Mutex<usize>,
}

impl FailingStateStore {
    /// Creates a store that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `saves` more saves through, then fails every save.
    pub fn fail_after(&self, saves: usize) {
        *self.saves_left.lock() = Some(saves);
    }

    /// Stops failing.
    pub fn heal(&self) {
        *self.saves_left.lock() = None;
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }
}

impl StateStore for FailingStateStore {
    fn load(&self) -> SyncResult<Option<TrackingSnapshot>> {
        self.inner.load()
    }

    fn save(&self, snapshot: &TrackingSnapshot) -> SyncResult<()> {
        {
            let mut left = self.saves_left.lock();
            match left.as_mut() {
                Some(0) => return Err(SyncError::Persistence("injected save failure".into())),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.inner.save(snapshot)?;
        *self.saves.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()
    }
}

/// One zone's adapter together with the stores behind it.
#[derive(Clone)]
pub struct ZoneFixture {
    /// The adapter.
    pub adapter: Arc<ObjectStoreAdapter>,
    /// Domain objects.
    pub objects: Arc<MemoryObjectStore>,
    /// Tracking snapshots.
    pub state: Arc<FailingStateStore>,
}

impl ZoneFixture {
    /// Builds an adapter over fresh in-memory stores, keeping its token
    /// under `namespace` in `kv`.
    pub fn build(zone: &ZoneId, kv: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        let objects = Arc::new(MemoryObjectStore::new());
        let state = Arc::new(FailingStateStore::new());
        let tokens = TokenStore::new(kv, namespace).zone(zone);
        let adapter = ObjectStoreAdapter::open(
            zone.clone(),
            objects.clone() as Arc<dyn ObjectStore>,
            state.clone() as Arc<dyn StateStore>,
            tokens,
        )
        .expect("open adapter");
        Self {
            adapter: Arc::new(adapter),
            objects,
            state,
        }
    }

    /// Inserts an object with text fields.
    pub fn insert(&self, identifier: &str, entity_type: &str, fields: &[(&str, &str)]) {
        let mut object = LocalObject::new(identifier, entity_type);
        for (name, value) in fields {
            object = object.with_field(*name, *value);
        }
        self.adapter.insert_object(object).expect("insert object");
    }

    /// Inserts a prepared object.
    pub fn insert_object(&self, object: LocalObject) {
        self.adapter.insert_object(object).expect("insert object");
    }

    /// Updates one text field.
    pub fn set_text(&self, identifier: &str, name: &str, value: &str) {
        let mut fields = FieldMap::new();
        fields.insert(name.to_string(), value.into());
        self.adapter
            .update_fields(identifier, fields)
            .expect("update fields");
    }

    /// Reads a committed object.
    pub fn object(&self, identifier: &str) -> Option<LocalObject> {
        self.adapter.object(identifier).expect("read object")
    }

    /// Reads one text field of a committed object.
    pub fn text(&self, identifier: &str, name: &str) -> Option<String> {
        self.object(identifier)
            .and_then(|object| object.field(name).and_then(|v| v.as_text()).map(String::from))
    }
}

/// Provider building in-memory adapters for discovered zones.
pub struct MemoryProvider {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
    refuse: Mutex<Vec<ZoneId>>,
    built: Mutex<BTreeMap<ZoneId, ZoneFixture>>,
    deleted: Mutex<Vec<ZoneId>>,
}

impl MemoryProvider {
    /// Creates a provider storing tokens under `namespace` in `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            kv,
            namespace: namespace.to_string(),
            refuse: Mutex::new(Vec::new()),
            built: Mutex::new(BTreeMap::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Declines to build an adapter for `zone`.
    pub fn refuse(&self, zone: &ZoneId) {
        self.refuse.lock().push(zone.clone());
    }

    /// Returns the fixture built for `zone`.
    pub fn fixture(&self, zone: &ZoneId) -> Option<ZoneFixture> {
        self.built.lock().get(zone).cloned()
    }

    /// Zones reported deleted, in order.
    pub fn deleted_zones(&self) -> Vec<ZoneId> {
        self.deleted.lock().clone()
    }
}

impl AdapterProvider for MemoryProvider {
    fn adapter_for_zone(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>> {
        if self.refuse.lock().contains(zone) {
            return None;
        }
        let fixture = ZoneFixture::build(zone, self.kv.clone(), &self.namespace);
        let adapter = fixture.adapter.clone() as Arc<dyn ModelAdapter>;
        self.built.lock().insert(zone.clone(), fixture);
        Some(adapter)
    }

    fn zone_was_deleted(&self, zone: &ZoneId) {
        self.deleted.lock().push(zone.clone());
    }
}

/// A simulated device: one engine with its own stores, on a shared server.
pub struct TestDevice {
    /// The engine.
    pub engine: SyncEngine<ServerRemote>,
    /// Key-value store holding tokens and device identity.
    pub kv: Arc<MemoryKeyValueStore>,
    namespace: String,
    zones: Mutex<BTreeMap<ZoneId, ZoneFixture>>,
}

impl TestDevice {
    /// Creates a device with [`test_config`].
    pub fn new(name: &str, remote: ServerRemote) -> Self {
        Self::with_config(test_config(name), remote)
    }

    /// Creates a device with a custom configuration.
    pub fn with_config(config: SyncConfig, remote: ServerRemote) -> Self {
        let kv = Arc::new(MemoryKeyValueStore::new());
        Self::with_store(config, remote, kv)
    }

    /// Creates a device over an existing key-value store, as after a restart.
    pub fn with_store(config: SyncConfig, remote: ServerRemote, kv: Arc<MemoryKeyValueStore>) -> Self {
        let namespace = config.identifier.clone();
        let engine = SyncEngine::new(config, remote, kv.clone() as Arc<dyn KeyValueStore>)
            .expect("create engine");
        Self {
            engine,
            kv,
            namespace,
            zones: Mutex::new(BTreeMap::new()),
        }
    }

    /// The remote this device talks to.
    pub fn remote(&self) -> &ServerRemote {
        self.engine.remote()
    }

    /// Builds and registers an adapter for `zone`.
    pub fn add_zone(&self, zone: &ZoneId) -> ZoneFixture {
        let fixture = ZoneFixture::build(zone, self.kv.clone(), &self.namespace);
        self.engine
            .add_zone_adapter(fixture.adapter.clone())
            .expect("register adapter");
        self.zones.lock().insert(zone.clone(), fixture.clone());
        fixture
    }

    /// Returns the fixture of a zone added with [`TestDevice::add_zone`].
    pub fn zone(&self, zone: &ZoneId) -> ZoneFixture {
        self.zones
            .lock()
            .get(zone)
            .cloned()
            .expect("zone was added to this device")
    }

    /// Runs one cycle and panics on failure.
    pub async fn sync(&self) -> zonesync_engine::SyncCycleResult {
        self.engine.synchronize().await.expect("sync cycle")
    }
}
