//! In-process remote service with fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use zonesync_engine::{RemoteError, RemoteResult, RemoteService};
use zonesync_protocol::{
    ChangeToken, DatabaseChanges, PushOutcome, RecordId, RemoteRecord, Subscription,
    SubscriptionId, ZoneChanges, ZoneId,
};
use zonesync_server::{ServerConfig, ServerError, SyncServer};

/// Remote operations, for fault injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOperation {
    /// `fetch_database_changes`
    FetchDatabaseChanges,
    /// `fetch_zone_changes`
    FetchZoneChanges,
    /// `push_records`
    PushRecords,
    /// `push_deletions`
    PushDeletions,
    /// `create_zone`
    CreateZone,
    /// `delete_zone`
    DeleteZone,
    /// `fetch_subscriptions`
    FetchSubscriptions,
    /// `create_subscription`
    CreateSubscription,
    /// `delete_subscription`
    DeleteSubscription,
}

/// Work run against the server just before a push is served.
pub type ServerHook = Box<dyn FnOnce(&SyncServer) + Send>;

#[derive(Default)]
struct Faults {
    queued: HashMap<RemoteOperation, VecDeque<RemoteError>>,
    push_limit: Option<usize>,
    before_push: Option<ServerHook>,
    calls: HashMap<RemoteOperation, usize>,
    push_sizes: Vec<usize>,
}

/// [`RemoteService`] backed by a shared [`SyncServer`].
///
/// Clones share the server and the fault plan, so two engines built from
/// clones of one `ServerRemote` behave like two devices on one account.
#[derive(Clone)]
pub struct ServerRemote {
    server: Arc<SyncServer>,
    faults: Arc<Mutex<Faults>>,
}

impl ServerRemote {
    /// Wraps an existing server.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Creates a remote over a fresh server with `config`.
    pub fn with_config(config: ServerConfig) -> Self {
        Self::new(Arc::new(SyncServer::new(config)))
    }

    /// Returns a handle sharing the server but with its own faults and counters.
    pub fn another_device(&self) -> Self {
        Self::new(self.server.clone())
    }

    /// The backing server.
    pub fn server(&self) -> &SyncServer {
        &self.server
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: RemoteOperation, error: RemoteError) {
        self.fail_times(operation, error, 1);
    }

    /// Makes the next `times` calls of `operation` fail with `error`.
    pub fn fail_times(&self, operation: RemoteOperation, error: RemoteError, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.queued.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Rejects record pushes larger than `limit` as too large.
    pub fn set_push_limit(&self, limit: Option<usize>) {
        self.faults.lock().push_limit = limit;
    }

    /// Runs `hook` on the server right before the next record push is
    /// served, simulating a writer racing this device.
    pub fn before_next_push(&self, hook: impl FnOnce(&SyncServer) + Send + 'static) {
        self.faults.lock().before_push = Some(Box::new(hook));
    }

    /// Number of times `operation` was called.
    pub fn calls(&self, operation: RemoteOperation) -> usize {
        self.faults
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Number of calls across all operations.
    pub fn total_calls(&self) -> usize {
        self.faults.lock().calls.values().sum()
    }

    /// Sizes of every record push attempted, rejected ones included.
    pub fn push_batch_sizes(&self) -> Vec<usize> {
        self.faults.lock().push_sizes.clone()
    }

    /// Clears call counters.
    pub fn reset_counters(&self) {
        let mut faults = self.faults.lock();
        faults.calls.clear();
        faults.push_sizes.clear();
    }

    fn begin(&self, operation: RemoteOperation) -> RemoteResult<()> {
        let mut faults = self.faults.lock();
        *faults.calls.entry(operation).or_insert(0) += 1;
        match faults
            .queued
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for ServerRemote {
    fn default() -> Self {
        Self::with_config(ServerConfig::default())
    }
}

fn remote_error(error: ServerError) -> RemoteError {
    match error {
        ServerError::ZoneNotFound(zone) => RemoteError::ZoneNotFound(zone),
        ServerError::BatchTooLarge { size, .. } => RemoteError::BatchTooLarge { size },
        other => RemoteError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl RemoteService for ServerRemote {
    async fn fetch_database_changes(
        &self,
        token: Option<&ChangeToken>,
    ) -> RemoteResult<DatabaseChanges> {
        self.begin(RemoteOperation::FetchDatabaseChanges)?;
        self.server
            .fetch_database_changes(token)
            .map_err(remote_error)
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> RemoteResult<ZoneChanges> {
        self.begin(RemoteOperation::FetchZoneChanges)?;
        self.server
            .fetch_zone_changes(zone, token, limit)
            .map_err(remote_error)
    }

    async fn push_records(
        &self,
        zone: &ZoneId,
        records: Vec<RemoteRecord>,
    ) -> RemoteResult<PushOutcome> {
        self.faults.lock().push_sizes.push(records.len());
        self.begin(RemoteOperation::PushRecords)?;
        let limit = self.faults.lock().push_limit;
        if let Some(limit) = limit {
            if records.len() > limit {
                return Err(RemoteError::BatchTooLarge {
                    size: records.len(),
                });
            }
        }
        let hook = self.faults.lock().before_push.take();
        if let Some(hook) = hook {
            hook(&self.server);
        }
        self.server.push_records(zone, records).map_err(remote_error)
    }

    async fn push_deletions(
        &self,
        zone: &ZoneId,
        ids: Vec<RecordId>,
    ) -> RemoteResult<Vec<RecordId>> {
        self.begin(RemoteOperation::PushDeletions)?;
        self.server.push_deletions(zone, ids).map_err(remote_error)
    }

    async fn create_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        self.begin(RemoteOperation::CreateZone)?;
        self.server.create_zone(zone);
        Ok(())
    }

    async fn delete_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        self.begin(RemoteOperation::DeleteZone)?;
        self.server.delete_zone(zone).map_err(remote_error)
    }

    async fn fetch_subscriptions(&self) -> RemoteResult<Vec<Subscription>> {
        self.begin(RemoteOperation::FetchSubscriptions)?;
        Ok(self.server.fetch_subscriptions())
    }

    async fn create_subscription(&self, zone: Option<&ZoneId>) -> RemoteResult<Subscription> {
        self.begin(RemoteOperation::CreateSubscription)?;
        Ok(self.server.create_subscription(zone))
    }

    async fn delete_subscription(&self, id: &SubscriptionId) -> RemoteResult<()> {
        self.begin(RemoteOperation::DeleteSubscription)?;
        self.server.delete_subscription(id);
        Ok(())
    }
}
