//! Remote record service boundary.
//!
//! The engine talks to the remote service exclusively through
//! [`RemoteService`]. Every method is a suspension point; everything between
//! two calls runs without awaiting.

use async_trait::async_trait;
use thiserror::Error;
use zonesync_protocol::{
    ChangeToken, DatabaseChanges, PushOutcome, RecordId, RemoteRecord, Subscription,
    SubscriptionId, ZoneChanges, ZoneId,
};

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote service implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Rate limit, network blip or service unavailable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The transport gave up waiting.
    #[error("request timed out")]
    Timeout,

    /// The request carried more items than the service accepts.
    #[error("batch of {size} items exceeds the service limit")]
    BatchTooLarge {
        /// Size of the rejected batch.
        size: usize,
    },

    /// The zone does not exist (never created, or deleted by another replica).
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),

    /// Any other failure. Not retried.
    #[error("{0}")]
    Fatal(String),
}

/// Operations the engine needs from the remote record service.
///
/// Implementations own timeouts and connection handling; a timeout must be
/// reported as [`RemoteError::Timeout`].
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Lists zones changed or deleted since `token`, one page at a time.
    async fn fetch_database_changes(
        &self,
        token: Option<&ChangeToken>,
    ) -> RemoteResult<DatabaseChanges>;

    /// Fetches one page of a zone's changes since `token`.
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> RemoteResult<ZoneChanges>;

    /// Saves records, reporting per-record success, conflict or failure.
    async fn push_records(
        &self,
        zone: &ZoneId,
        records: Vec<RemoteRecord>,
    ) -> RemoteResult<PushOutcome>;

    /// Deletes records, returning the identifiers the service acknowledged.
    async fn push_deletions(&self, zone: &ZoneId, ids: Vec<RecordId>)
        -> RemoteResult<Vec<RecordId>>;

    /// Creates a zone. Creating an existing zone succeeds.
    async fn create_zone(&self, zone: &ZoneId) -> RemoteResult<()>;

    /// Deletes a zone and every record in it.
    async fn delete_zone(&self, zone: &ZoneId) -> RemoteResult<()>;

    /// Lists existing subscriptions.
    async fn fetch_subscriptions(&self) -> RemoteResult<Vec<Subscription>>;

    /// Creates a subscription for `zone`, or for the whole database when `None`.
    async fn create_subscription(&self, zone: Option<&ZoneId>) -> RemoteResult<Subscription>;

    /// Deletes a subscription.
    async fn delete_subscription(&self, id: &SubscriptionId) -> RemoteResult<()>;
}
