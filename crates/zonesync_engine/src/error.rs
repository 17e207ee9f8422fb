//! Error types for the sync engine.

use crate::remote::RemoteError;
use thiserror::Error;
use zonesync_protocol::{ProtocolError, ZoneId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A cycle was requested while another one is running.
    #[error("a synchronization is already in progress")]
    AlreadySyncing,

    /// The cycle was cancelled between steps.
    #[error("synchronization cancelled")]
    Cancelled,

    /// A record was written by a replica with a newer schema version.
    #[error("record with compatibility version {found} found, local maximum is {supported}")]
    HigherModelVersionFound {
        /// Version carried by the incoming record.
        found: i64,
        /// Highest version this replica understands.
        supported: i64,
    },

    /// Rate limit, network blip or timeout; retried with backoff.
    #[error("transient remote error: {message}")]
    Transient {
        /// Error message.
        message: String,
    },

    /// The remote service rejected a batch as too large.
    #[error("batch of {size} items is too large")]
    BatchTooLarge {
        /// Size of the rejected batch.
        size: usize,
    },

    /// Non-retryable remote failure.
    #[error("remote error: {message}")]
    Remote {
        /// Error message.
        message: String,
    },

    /// The zone does not exist remotely.
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),

    /// Push reported records changed on the server after upload retries ran out.
    #[error("{count} records changed on the server while uploading")]
    ServerRecordChanged {
        /// Number of conflicting records in the last push.
        count: usize,
    },

    /// Local commit failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Custom conflict delegate failed.
    #[error("conflict delegate error: {0}")]
    ConflictDelegate(String),

    /// A local mutation named an object the store does not hold.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// An import operation ran outside `begin_import`/`finish_import`.
    #[error("no import batch is open")]
    NoImportBatch,

    /// Registering a second adapter for the same zone.
    #[error("an adapter is already registered for zone {0}")]
    DuplicateAdapter(ZoneId),

    /// Record encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    /// Returns true if the cycle ended because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Transient(message) => SyncError::Transient { message },
            RemoteError::Timeout => SyncError::transient("remote call timed out"),
            RemoteError::BatchTooLarge { size } => SyncError::BatchTooLarge { size },
            RemoteError::ZoneNotFound(zone) => SyncError::ZoneNotFound(zone),
            RemoteError::Fatal(message) => SyncError::Remote { message },
        }
    }
}
