//! Durable storage of an adapter's sync metadata.
//!
//! The snapshot holds the Tracking Records (in insertion order) and the
//! pending relationship edges of one zone.

use crate::error::{SyncError, SyncResult};
use crate::kv::write_atomic;
use crate::pending::PendingRelationship;
use crate::tracking::TrackingRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted sync metadata of one zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    /// Tracking records in insertion order.
    pub records: Vec<TrackingRecord>,
    /// Pending relationship edges in insertion order.
    pub edges: Vec<PendingRelationship>,
}

impl TrackingSnapshot {
    /// Encodes the snapshot to CBOR.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| SyncError::persistence(format!("encode snapshot: {e}")))?;
        Ok(bytes)
    }

    /// Decodes a snapshot from CBOR.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| SyncError::persistence(format!("decode snapshot: {e}")))
    }
}

/// Durable home of a [`TrackingSnapshot`].
pub trait StateStore: Send + Sync {
    /// Loads the last saved snapshot.
    fn load(&self) -> SyncResult<Option<TrackingSnapshot>>;

    /// Replaces the stored snapshot. Must be atomic.
    fn save(&self, snapshot: &TrackingSnapshot) -> SyncResult<()>;

    /// Removes the stored snapshot.
    fn clear(&self) -> SyncResult<()>;
}

/// Keeps the snapshot in memory. State is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: RwLock<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> SyncResult<Option<TrackingSnapshot>> {
        self.snapshot
            .read()
            .as_deref()
            .map(TrackingSnapshot::decode)
            .transpose()
    }

    fn save(&self, snapshot: &TrackingSnapshot) -> SyncResult<()> {
        *self.snapshot.write() = Some(snapshot.encode()?);
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        *self.snapshot.write() = None;
        Ok(())
    }
}

/// Keeps the snapshot in a CBOR file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Uses the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> SyncResult<Option<TrackingSnapshot>> {
        match fs::read(&self.path) {
            Ok(bytes) => TrackingSnapshot::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, snapshot: &TrackingSnapshot) -> SyncResult<()> {
        write_atomic(&self.path, &snapshot.encode()?)
    }

    fn clear(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
