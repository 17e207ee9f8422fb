//! The synchronization engine.
//!
//! One cycle runs fetch, import, relationship resolution and commit per
//! page, then upload and remote deletion, then a token finalization pass.
//! Zones run as independent sub-pipelines polled concurrently; each is
//! strictly sequential internally. Suspension points are the remote calls.

use crate::adapter::ModelAdapter;
use crate::config::{SyncConfig, SyncMode, DEVICE_ID_FIELD, MODEL_VERSION_FIELD};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
use crate::kv::KeyValueStore;
use crate::registry::{AdapterProvider, ZoneRegistry};
use crate::remote::{RemoteResult, RemoteService};
use crate::state::{CycleState, SyncCycleResult, SyncStats};
use crate::tokens::TokenStore;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zonesync_protocol::{ChangeToken, FieldValue, RecordId, RemoteRecord, SubscriptionId, ZoneId};

/// Clears the syncing flag when a cycle ends or its future is dropped.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Synchronizes registered zones with a remote record service.
pub struct SyncEngine<R: RemoteService> {
    config: SyncConfig,
    remote: R,
    tokens: TokenStore,
    registry: ZoneRegistry,
    provider: RwLock<Option<Arc<dyn AdapterProvider>>>,
    state: RwLock<CycleState>,
    stats: RwLock<SyncStats>,
    syncing: AtomicBool,
    cancelled: AtomicBool,
    batch_size: AtomicUsize,
    events: broadcast::Sender<SyncEvent>,
}

impl<R: RemoteService> SyncEngine<R> {
    /// Creates an engine keeping its bookkeeping in `kv`.
    ///
    /// A push batch size adapted by an earlier run is picked up from `kv`.
    pub fn new(config: SyncConfig, remote: R, kv: Arc<dyn KeyValueStore>) -> SyncResult<Self> {
        let tokens = TokenStore::new(kv, config.identifier.clone());
        let batch_size = tokens
            .batch_size()?
            .map_or(config.batch_size, |remembered| remembered.min(config.batch_size))
            .max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            remote,
            tokens,
            registry: ZoneRegistry::new(),
            provider: RwLock::new(None),
            state: RwLock::new(CycleState::Idle),
            stats: RwLock::new(SyncStats::default()),
            syncing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            batch_size: AtomicUsize::new(batch_size),
            events,
        })
    }

    /// Sets the provider asked for adapters of newly discovered zones (builder style).
    pub fn with_provider(self, provider: Arc<dyn AdapterProvider>) -> Self {
        self.set_provider(Some(provider));
        self
    }

    /// Replaces or removes the adapter provider.
    pub fn set_provider(&self, provider: Option<Arc<dyn AdapterProvider>>) {
        *self.provider.write() = provider;
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the remote service.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Gets the current cycle state.
    pub fn state(&self) -> CycleState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a cycle is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Returns this device's identifier.
    pub fn device_id(&self) -> SyncResult<String> {
        self.tokens.device_id()
    }

    /// Returns the current push batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    /// Registers an observer of cycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Requests cancellation of the running cycle.
    ///
    /// In-flight remote calls finish; no further step starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Registers the adapter of a zone.
    pub fn add_zone_adapter(&self, adapter: Arc<dyn ModelAdapter>) -> SyncResult<()> {
        let zone = adapter.zone().clone();
        self.registry.register(adapter)?;
        debug!(zone = %zone, "adapter added");
        self.emit(SyncEvent::AdapterAdded(zone));
        Ok(())
    }

    /// Unregisters and returns the adapter of a zone.
    pub fn remove_zone_adapter(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>> {
        self.registry.remove(zone)
    }

    /// Returns the adapter of a zone.
    pub fn adapter(&self, zone: &ZoneId) -> Option<Arc<dyn ModelAdapter>> {
        self.registry.get(zone)
    }

    /// Returns every registered zone.
    pub fn zones(&self) -> Vec<ZoneId> {
        self.registry.zones()
    }

    /// Drops all tokens, tracking and the device identifier without touching
    /// the remote. Domain objects stay.
    pub fn erase_local_metadata(&self) -> SyncResult<()> {
        if self.is_syncing() {
            return Err(SyncError::AlreadySyncing);
        }
        for adapter in self.registry.adapters() {
            adapter.reset_all_tracking()?;
            self.tokens.clear_zone(adapter.zone())?;
        }
        self.tokens.set_database_token(None)?;
        self.tokens.set_database_subscription(None)?;
        self.tokens.clear_device_id()?;
        info!(engine = %self.config.identifier, "local sync metadata erased");
        Ok(())
    }

    /// Deletes a zone and all its records remotely, then wipes its local
    /// tracking. The adapter stays registered.
    pub async fn delete_remote_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        if self.is_syncing() {
            return Err(SyncError::AlreadySyncing);
        }
        let remote = &self.remote;
        self.with_retry("delete zone", move || remote.delete_zone(zone))
            .await?;
        if let Some(adapter) = self.registry.get(zone) {
            adapter.reset_all_tracking()?;
        }
        self.tokens.clear_zone(zone)?;
        info!(zone = %zone, "remote zone deleted");
        Ok(())
    }

    /// Forgets the database token so the next cycle rescans every zone.
    pub fn reset_database_token(&self) -> SyncResult<()> {
        self.tokens.set_database_token(None)
    }

    /// Restores the configured push batch size.
    pub fn reset_batch_size(&self) -> SyncResult<()> {
        self.batch_size
            .store(self.config.batch_size.max(1), Ordering::SeqCst);
        self.tokens.set_batch_size(None)
    }

    /// Subscribes to remote changes of one zone, adopting an existing
    /// subscription when there is one.
    pub async fn subscribe_for_changes(&self, zone: &ZoneId) -> SyncResult<SubscriptionId> {
        let id = self.ensure_subscription(Some(zone)).await?;
        self.tokens.set_zone_subscription(zone, Some(&id))?;
        Ok(id)
    }

    /// Subscribes to zone creation and deletion across the database.
    pub async fn subscribe_for_database_changes(&self) -> SyncResult<SubscriptionId> {
        let id = self.ensure_subscription(None).await?;
        self.tokens.set_database_subscription(Some(&id))?;
        Ok(id)
    }

    /// Deletes every subscription this engine stored.
    pub async fn cancel_subscriptions(&self) -> SyncResult<()> {
        let remote = &self.remote;
        for zone in self.registry.zones() {
            if let Some(id) = self.tokens.zone_subscription(&zone)? {
                let id_ref = &id;
                self.with_retry("delete subscription", move || {
                    remote.delete_subscription(id_ref)
                })
                .await?;
                self.tokens.set_zone_subscription(&zone, None)?;
            }
        }
        if let Some(id) = self.tokens.database_subscription()? {
            let id_ref = &id;
            self.with_retry("delete subscription", move || {
                remote.delete_subscription(id_ref)
            })
            .await?;
            self.tokens.set_database_subscription(None)?;
        }
        Ok(())
    }

    async fn ensure_subscription(&self, zone: Option<&ZoneId>) -> SyncResult<SubscriptionId> {
        let stored = match zone {
            Some(zone) => self.tokens.zone_subscription(zone)?,
            None => self.tokens.database_subscription()?,
        };
        let remote = &self.remote;
        let existing = self
            .with_retry("fetch subscriptions", move || remote.fetch_subscriptions())
            .await?;

        if let Some(id) = stored {
            if existing.iter().any(|subscription| subscription.id == id) {
                return Ok(id);
            }
        }
        if let Some(found) = existing
            .into_iter()
            .find(|subscription| subscription.zone.as_ref() == zone)
        {
            debug!(subscription = found.id.as_str(), "adopted existing subscription");
            return Ok(found.id);
        }

        let created = self
            .with_retry("create subscription", move || {
                remote.create_subscription(zone)
            })
            .await?;
        debug!(subscription = created.id.as_str(), "subscription created");
        Ok(created.id)
    }

    /// Runs one sync cycle over every registered zone.
    ///
    /// Fails with [`SyncError::AlreadySyncing`] without any remote call when
    /// a cycle is already running.
    pub async fn synchronize(&self) -> SyncResult<SyncCycleResult> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("synchronize called while a cycle is running");
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = SyncingGuard(&self.syncing);
        self.cancelled.store(false, Ordering::SeqCst);

        let start = Instant::now();
        info!(engine = %self.config.identifier, zones = self.registry.len(), "sync cycle started");
        self.emit(SyncEvent::WillSynchronize);

        match self.run_cycle().await {
            Ok(mut result) => {
                result.duration = start.elapsed();
                self.set_state(CycleState::Idle);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.records_downloaded += result.downloaded;
                    stats.records_uploaded += result.uploaded;
                    stats.records_deleted += result.deleted;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                info!(
                    downloaded = result.downloaded,
                    uploaded = result.uploaded,
                    deleted = result.deleted,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "sync cycle finished"
                );
                self.emit(SyncEvent::DidSynchronize);
                Ok(result)
            }
            Err(e) => {
                self.handle_error(&e);
                if e.is_cancelled() {
                    self.emit(SyncEvent::DidCancel);
                } else {
                    self.emit(SyncEvent::DidFail(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> SyncResult<SyncCycleResult> {
        let device_id = self.tokens.device_id()?;
        let mut totals = SyncCycleResult::default();
        let mut rounds = 0u32;

        loop {
            self.check_cancelled()?;
            self.fetch_changes(&device_id, &mut totals).await?;
            if self.config.sync_mode == SyncMode::DownloadOnly {
                break;
            }

            self.check_cancelled()?;
            let upload = self.upload_changes(&device_id).await?;
            totals.absorb(&upload);

            if upload.conflicts == 0 {
                if upload.uploaded > 0 || upload.deleted > 0 {
                    self.check_cancelled()?;
                    self.set_state(CycleState::Finalizing);
                    self.finalize_tokens(&device_id, &mut totals).await?;
                }
                break;
            }

            self.stats.write().conflicts_encountered += upload.conflicts;
            rounds += 1;
            if rounds > self.config.max_upload_retries {
                return Err(SyncError::ServerRecordChanged {
                    count: upload.conflicts as usize,
                });
            }
            info!(
                round = rounds,
                conflicts = upload.conflicts,
                "server records changed during upload, fetching again"
            );
        }

        self.set_state(CycleState::Finalizing);
        totals.zones = self.registry.len();
        Ok(totals)
    }

    /// Reads the database feed, then fetches every changed or never fetched zone.
    async fn fetch_changes(&self, device_id: &str, totals: &mut SyncCycleResult) -> SyncResult<()> {
        self.set_state(CycleState::FetchingChanges);
        self.emit(SyncEvent::WillFetchChanges);

        let (changed, database_token) = self.fetch_database_changes().await?;

        let mut adapters = Vec::new();
        for adapter in self.registry.adapters() {
            if changed.contains(adapter.zone()) || adapter.server_change_token()?.is_none() {
                adapters.push(adapter);
            }
        }
        self.fetch_zones(adapters, device_id, totals).await?;

        // Only after every zone the feed named is committed.
        if let Some(token) = database_token {
            self.tokens.set_database_token(Some(&token))?;
        }
        Ok(())
    }

    async fn fetch_zones(
        &self,
        adapters: Vec<Arc<dyn ModelAdapter>>,
        device_id: &str,
        totals: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        let results = join_all(
            adapters
                .into_iter()
                .map(|adapter| self.fetch_zone(adapter, device_id)),
        )
        .await;
        for result in results {
            totals.absorb(&result?);
        }
        Ok(())
    }

    async fn fetch_database_changes(
        &self,
    ) -> SyncResult<(BTreeSet<ZoneId>, Option<ChangeToken>)> {
        let mut token = self.tokens.database_token()?;
        let mut changed = BTreeSet::new();
        let mut deleted = BTreeSet::new();

        loop {
            self.check_cancelled()?;
            let remote = &self.remote;
            let token_ref = token.as_ref();
            let page = self
                .with_retry("fetch database changes", move || {
                    remote.fetch_database_changes(token_ref)
                })
                .await?;

            changed.extend(page.changed_zones);
            deleted.extend(page.deleted_zones);
            if page.token.is_some() {
                token = page.token;
            }
            if !page.more_coming {
                break;
            }
        }

        for zone in &deleted {
            changed.remove(zone);
            self.handle_zone_deleted(zone)?;
        }

        for zone in &changed {
            if self.registry.contains(zone) {
                continue;
            }
            let provider = self.provider.read().clone();
            match provider.and_then(|provider| provider.adapter_for_zone(zone)) {
                Some(adapter) => self.add_zone_adapter(adapter)?,
                None => debug!(zone = %zone, "no adapter for zone, changes skipped"),
            }
        }

        debug!(changed = changed.len(), deleted = deleted.len(), "database changes fetched");
        Ok((changed, token))
    }

    /// Fetches, imports and commits one zone page by page.
    async fn fetch_zone(
        &self,
        adapter: Arc<dyn ModelAdapter>,
        device_id: &str,
    ) -> SyncResult<SyncCycleResult> {
        let zone = adapter.zone().clone();
        let mut token = adapter.server_change_token()?;
        let mut result = SyncCycleResult::default();
        let mut pages = 0usize;
        self.emit(SyncEvent::WillFetchZone(zone.clone()));

        loop {
            self.check_cancelled()?;
            let remote = &self.remote;
            let zone_ref = &zone;
            let token_ref = token.as_ref();
            let limit = self.config.fetch_page_size;
            let fetched = self
                .with_retry("fetch zone changes", move || {
                    remote.fetch_zone_changes(zone_ref, token_ref, limit)
                })
                .await;

            let page = match fetched {
                Ok(page) => page,
                Err(SyncError::ZoneNotFound(_)) if token.is_none() => {
                    debug!(zone = %zone, "zone not created remotely yet");
                    return Ok(result);
                }
                Err(SyncError::ZoneNotFound(missing)) => {
                    self.handle_zone_deleted(&missing)?;
                    return Ok(result);
                }
                Err(e) => return Err(e),
            };

            let records = self.prepare_incoming(page.records, Some(device_id))?;
            if !records.is_empty() || !page.deleted.is_empty() {
                self.import_page(&*adapter, &records, &page.deleted)?;
            }
            adapter.save_token(Some(&page.token))?;

            result.downloaded += records.len() as u64;
            result.remote_deletions += page.deleted.len() as u64;
            pages += 1;
            token = Some(page.token);
            if !page.more_coming {
                break;
            }
        }

        debug!(zone = %zone, pages, downloaded = result.downloaded, "zone fetched");
        self.emit(SyncEvent::DidFetchZone(zone));
        Ok(result)
    }

    /// Applies one page inside an import scope that is always closed.
    fn import_page(
        &self,
        adapter: &dyn ModelAdapter,
        records: &[RemoteRecord],
        deleted: &[RecordId],
    ) -> SyncResult<()> {
        adapter.begin_import()?;
        let result = self.apply_page(adapter, records, deleted);
        adapter.finish_import(result.as_ref().err());
        result
    }

    fn apply_page(
        &self,
        adapter: &dyn ModelAdapter,
        records: &[RemoteRecord],
        deleted: &[RecordId],
    ) -> SyncResult<()> {
        self.set_state(CycleState::Importing);
        adapter.apply_remote_changes(records)?;
        adapter.apply_remote_deletions(deleted)?;
        self.set_state(CycleState::ResolvingRelationships);
        adapter.resolve_pending_relationships()?;
        adapter.commit_import()
    }

    /// Checks compatibility versions, drops this device's own records when
    /// `device_id` is given, and strips metadata fields.
    fn prepare_incoming(
        &self,
        records: Vec<RemoteRecord>,
        device_id: Option<&str>,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let supported = self.config.compatibility_version;
        let mut prepared = Vec::with_capacity(records.len());

        for mut record in records {
            if supported > 0 {
                if let Some(found) = record
                    .field(MODEL_VERSION_FIELD)
                    .and_then(FieldValue::as_integer)
                {
                    if found > supported {
                        return Err(SyncError::HigherModelVersionFound { found, supported });
                    }
                }
            }
            if let Some(device_id) = device_id {
                if record.field(DEVICE_ID_FIELD).and_then(FieldValue::as_text) == Some(device_id) {
                    continue;
                }
            }
            for key in &self.config.metadata_keys {
                record.remove_field(key);
            }
            prepared.push(record);
        }
        Ok(prepared)
    }

    fn tag_outgoing(&self, mut record: RemoteRecord, device_id: &str) -> RemoteRecord {
        record.set_field(DEVICE_ID_FIELD, FieldValue::Text(device_id.to_string()));
        if self.config.compatibility_version > 0 {
            record.set_field(
                MODEL_VERSION_FIELD,
                FieldValue::Integer(self.config.compatibility_version),
            );
        }
        record
    }

    async fn upload_changes(&self, device_id: &str) -> SyncResult<SyncCycleResult> {
        self.set_state(CycleState::Uploading);
        self.emit(SyncEvent::WillUploadChanges);

        let results = join_all(
            self.registry
                .adapters()
                .into_iter()
                .map(|adapter| self.upload_zone(adapter, device_id)),
        )
        .await;

        let mut totals = SyncCycleResult::default();
        for result in results {
            totals.absorb(&result?);
        }
        Ok(totals)
    }

    /// Pushes one zone's changes then its deletions.
    ///
    /// Stops early when the server reports changed records; those are
    /// imported and the caller fetches again.
    async fn upload_zone(
        &self,
        adapter: Arc<dyn ModelAdapter>,
        device_id: &str,
    ) -> SyncResult<SyncCycleResult> {
        let mut result = SyncCycleResult::default();
        if !adapter.has_pending_local_changes()? {
            return Ok(result);
        }

        let zone = adapter.zone().clone();
        let remote = &self.remote;
        let zone_ref = &zone;
        self.emit(SyncEvent::WillUploadZone(zone.clone()));

        if adapter.server_change_token()?.is_none() {
            self.with_retry("create zone", move || remote.create_zone(zone_ref))
                .await?;
            debug!(zone = %zone, "zone created");
        }

        self.set_state(CycleState::Uploading);
        loop {
            self.check_cancelled()?;
            let records: Vec<RemoteRecord> = adapter
                .changes_to_upload(self.batch_size())?
                .into_iter()
                .map(|record| self.tag_outgoing(record, device_id))
                .collect();
            if records.is_empty() {
                break;
            }

            let count = records.len();
            let batch = &records;
            let outcome = match self
                .with_retry("push records", move || {
                    remote.push_records(zone_ref, batch.clone())
                })
                .await
            {
                Ok(outcome) => outcome,
                Err(SyncError::BatchTooLarge { .. }) => {
                    self.shrink_batch_size(count)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            adapter.acknowledge_uploaded(&outcome.saved)?;
            result.uploaded += outcome.saved.len() as u64;

            if let Some(failure) = outcome.failed.first() {
                return Err(SyncError::Remote {
                    message: format!("{}: {}", failure.id, failure.reason),
                });
            }
            if !outcome.conflicts.is_empty() {
                result.conflicts += outcome.conflicts.len() as u64;
                warn!(zone = %zone, conflicts = outcome.conflicts.len(), "server records changed");
                let conflicts = self.prepare_incoming(outcome.conflicts, None)?;
                self.import_page(&*adapter, &conflicts, &[])?;
                return Ok(result);
            }
            if outcome.saved.is_empty() {
                break;
            }
        }

        self.set_state(CycleState::DeletingRemote);
        loop {
            self.check_cancelled()?;
            let ids = adapter.deletions_to_upload(self.batch_size())?;
            if ids.is_empty() {
                break;
            }

            let count = ids.len();
            let batch = &ids;
            let acknowledged = match self
                .with_retry("push deletions", move || {
                    remote.push_deletions(zone_ref, batch.clone())
                })
                .await
            {
                Ok(acknowledged) => acknowledged,
                Err(SyncError::BatchTooLarge { .. }) => {
                    self.shrink_batch_size(count)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            adapter.acknowledge_deleted(&acknowledged)?;
            result.deleted += acknowledged.len() as u64;
            if acknowledged.len() < count {
                warn!(zone = %zone, requested = count, acknowledged = acknowledged.len(), "remote skipped deletions");
                break;
            }
        }

        debug!(zone = %zone, uploaded = result.uploaded, deleted = result.deleted, "zone uploaded");
        Ok(result)
    }

    /// Re-reads each zone's feed after an upload so the token moves past
    /// this device's own records.
    async fn finalize_tokens(
        &self,
        device_id: &str,
        totals: &mut SyncCycleResult,
    ) -> SyncResult<()> {
        let adapters = self.registry.adapters();
        let before = totals.downloaded;
        self.fetch_zones(adapters, device_id, totals).await?;
        if totals.downloaded > before {
            debug!(
                downloaded = totals.downloaded - before,
                "new remote changes imported while finalizing"
            );
        }
        Ok(())
    }

    fn shrink_batch_size(&self, rejected: usize) -> SyncResult<()> {
        if rejected <= 1 {
            return Err(SyncError::Remote {
                message: "remote rejected a single-record batch as too large".into(),
            });
        }
        let reduced = (rejected / 2).max(1);
        let previous = self.batch_size.fetch_min(reduced, Ordering::SeqCst);
        let current = previous.min(reduced);
        self.tokens.set_batch_size(Some(current))?;
        warn!(rejected, batch_size = current, "batch too large, reducing batch size");
        Ok(())
    }

    fn handle_zone_deleted(&self, zone: &ZoneId) -> SyncResult<()> {
        let Some(adapter) = self.registry.remove(zone) else {
            return Ok(());
        };
        adapter.reset_all_tracking()?;
        self.tokens.clear_zone(zone)?;
        if let Some(provider) = self.provider.read().clone() {
            provider.zone_was_deleted(zone);
        }
        info!(zone = %zone, "remote zone deleted, adapter discarded");
        self.emit(SyncEvent::ZoneDeleted(zone.clone()));
        Ok(())
    }

    /// Runs a remote call, retrying transient failures with backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => SyncError::from(e),
            };
            attempt += 1;
            if !error.is_retryable() || attempt >= retry.max_attempts {
                return Err(error);
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(operation, attempt, error = %error, delay_ms = delay.as_millis() as u64, "retrying remote call");
            self.stats.write().retries += 1;
            tokio::time::sleep(delay).await;
            self.check_cancelled()?;
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: CycleState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn handle_error(&self, error: &SyncError) {
        if error.is_cancelled() {
            info!("sync cycle cancelled");
            self.set_state(CycleState::Cancelled);
            return;
        }
        warn!(error = %error, "sync cycle failed");
        self.set_state(CycleState::Error);
        let mut stats = self.stats.write();
        stats.cycles_failed += 1;
        stats.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::kv::MemoryKeyValueStore;
    use crate::remote::RemoteError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use zonesync_protocol::{DatabaseChanges, PushOutcome, Subscription, ZoneChanges};

    /// Remote with an empty database, an optional gate on the first call and
    /// a queue of errors for the database feed.
    #[derive(Default)]
    struct StubRemote {
        calls: AtomicUsize,
        gate: Option<Notify>,
        failures: Mutex<Vec<RemoteError>>,
    }

    impl StubRemote {
        fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Default::default()
            }
        }

        fn failing(failures: Vec<RemoteError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn open_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }
    }

    #[async_trait]
    impl RemoteService for StubRemote {
        async fn fetch_database_changes(
            &self,
            _token: Option<&ChangeToken>,
        ) -> RemoteResult<DatabaseChanges> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let failure = self.failures.lock().pop();
            match failure {
                Some(error) => Err(error),
                None => Ok(DatabaseChanges::default()),
            }
        }

        async fn fetch_zone_changes(
            &self,
            zone: &ZoneId,
            _token: Option<&ChangeToken>,
            _limit: usize,
        ) -> RemoteResult<ZoneChanges> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::ZoneNotFound(zone.clone()))
        }

        async fn push_records(
            &self,
            _zone: &ZoneId,
            records: Vec<RemoteRecord>,
        ) -> RemoteResult<PushOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PushOutcome::saved(records))
        }

        async fn push_deletions(
            &self,
            _zone: &ZoneId,
            ids: Vec<RecordId>,
        ) -> RemoteResult<Vec<RecordId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ids)
        }

        async fn create_zone(&self, _zone: &ZoneId) -> RemoteResult<()> {
            Ok(())
        }

        async fn delete_zone(&self, _zone: &ZoneId) -> RemoteResult<()> {
            Ok(())
        }

        async fn fetch_subscriptions(&self) -> RemoteResult<Vec<Subscription>> {
            Ok(Vec::new())
        }

        async fn create_subscription(&self, zone: Option<&ZoneId>) -> RemoteResult<Subscription> {
            Ok(Subscription {
                id: SubscriptionId::new("sub-1"),
                zone: zone.cloned(),
            })
        }

        async fn delete_subscription(&self, _id: &SubscriptionId) -> RemoteResult<()> {
            Ok(())
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false)
    }

    fn engine(remote: StubRemote) -> SyncEngine<StubRemote> {
        let config = SyncConfig::new("test").with_retry(fast_retry());
        SyncEngine::new(config, remote, Arc::new(MemoryKeyValueStore::new())).unwrap()
    }

    #[tokio::test]
    async fn empty_cycle_succeeds() {
        let engine = engine(StubRemote::default());
        let result = engine.synchronize().await.unwrap();
        assert_eq!(result.downloaded, 0);
        assert_eq!(engine.state(), CycleState::Idle);
        assert!(!engine.is_syncing());
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn concurrent_synchronize_is_rejected_without_remote_calls() {
        let engine = engine(StubRemote::gated());

        let second = async {
            tokio::task::yield_now().await;
            let calls_before = engine.remote().calls();
            let result = engine.synchronize().await;
            let calls_after = engine.remote().calls();
            engine.remote().open_gate();
            (result, calls_before, calls_after)
        };
        let (first, (second, before, after)) = tokio::join!(engine.synchronize(), second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadySyncing)));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn cancel_stops_between_steps() {
        let engine = engine(StubRemote::gated());
        let mut events = engine.subscribe();

        let canceller = async {
            tokio::task::yield_now().await;
            engine.cancel();
            engine.remote().open_gate();
        };
        let (result, ()) = tokio::join!(engine.synchronize(), canceller);

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(engine.state(), CycleState::Cancelled);
        assert!(!engine.is_syncing());
        assert_eq!(engine.stats().cycles_failed, 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&SyncEvent::DidCancel));
        assert!(!seen.iter().any(|e| matches!(e, SyncEvent::DidFail(_))));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let engine = engine(StubRemote::failing(vec![
            RemoteError::Timeout,
            RemoteError::Transient("rate limited".into()),
        ]));
        engine.synchronize().await.unwrap();
        assert_eq!(engine.remote().calls(), 3);
        assert_eq!(engine.stats().retries, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let engine = engine(StubRemote::failing(vec![
            RemoteError::Timeout,
            RemoteError::Timeout,
            RemoteError::Timeout,
        ]));
        let err = engine.synchronize().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.state(), CycleState::Error);
        assert!(engine.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let engine = engine(StubRemote::failing(vec![RemoteError::Fatal("denied".into())]));
        assert!(matches!(
            engine.synchronize().await,
            Err(SyncError::Remote { .. })
        ));
        assert_eq!(engine.remote().calls(), 1);
    }

    #[tokio::test]
    async fn lifecycle_events_are_broadcast() {
        let engine = engine(StubRemote::default());
        let mut events = engine.subscribe();
        engine.synchronize().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.first(), Some(&SyncEvent::WillSynchronize));
        assert!(seen.contains(&SyncEvent::WillFetchChanges));
        assert!(seen.contains(&SyncEvent::WillUploadChanges));
        assert_eq!(seen.last(), Some(&SyncEvent::DidSynchronize));
    }

    #[tokio::test]
    async fn download_only_skips_upload() {
        let config = SyncConfig::new("test")
            .with_retry(fast_retry())
            .with_sync_mode(SyncMode::DownloadOnly);
        let engine =
            SyncEngine::new(config, StubRemote::default(), Arc::new(MemoryKeyValueStore::new()))
                .unwrap();
        let mut events = engine.subscribe();
        engine.synchronize().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.contains(&SyncEvent::WillUploadChanges));
    }

    #[tokio::test]
    async fn remembered_batch_size_is_loaded() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        TokenStore::new(Arc::clone(&kv), "test")
            .set_batch_size(Some(25))
            .unwrap();

        let engine = SyncEngine::new(SyncConfig::new("test"), StubRemote::default(), kv).unwrap();
        assert_eq!(engine.batch_size(), 25);

        engine.reset_batch_size().unwrap();
        assert_eq!(engine.batch_size(), SyncConfig::default().batch_size);
    }

    #[tokio::test]
    async fn subscriptions_are_stored_and_cancelled() {
        let engine = engine(StubRemote::default());
        let id = engine.subscribe_for_database_changes().await.unwrap();
        assert_eq!(id, SubscriptionId::new("sub-1"));
        assert_eq!(engine.tokens.database_subscription().unwrap(), Some(id));

        engine.cancel_subscriptions().await.unwrap();
        assert_eq!(engine.tokens.database_subscription().unwrap(), None);
    }
}
