//! Cycle lifecycle events.
//!
//! Events are fire-and-forget: they are broadcast on a channel owned by one
//! engine instance and dropped when nobody listens.

use zonesync_protocol::ZoneId;

/// Capacity of an engine's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A notable step of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A cycle is starting.
    WillSynchronize,
    /// The database change feed is about to be read.
    WillFetchChanges,
    /// A zone's changes are about to be fetched.
    WillFetchZone(ZoneId),
    /// A zone's changes have been fetched and committed.
    DidFetchZone(ZoneId),
    /// The upload phase is starting.
    WillUploadChanges,
    /// Records are about to be uploaded to a zone for the first time this cycle.
    WillUploadZone(ZoneId),
    /// An adapter supplied by the provider was registered.
    AdapterAdded(ZoneId),
    /// A zone was deleted remotely and its adapter discarded.
    ZoneDeleted(ZoneId),
    /// The cycle completed.
    DidSynchronize,
    /// The cycle was cancelled before it completed.
    DidCancel,
    /// The cycle failed.
    DidFail(String),
}
