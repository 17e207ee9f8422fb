//! Cycle state and statistics.

use std::time::{Duration, Instant};

/// Step of the sync cycle the engine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle running.
    Idle,
    /// Reading remote change feeds.
    FetchingChanges,
    /// Handing fetched records to adapters.
    Importing,
    /// Linking pending relationships.
    ResolvingRelationships,
    /// Pushing local changes.
    Uploading,
    /// Pushing local deletions.
    DeletingRemote,
    /// Persisting final tokens.
    Finalizing,
    /// The last cycle failed.
    Error,
    /// The last cycle was cancelled.
    Cancelled,
}

impl CycleState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            CycleState::Idle | CycleState::Error | CycleState::Cancelled
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of cycles that ended in an error.
    pub cycles_failed: u64,
    /// Total number of records imported.
    pub records_downloaded: u64,
    /// Total number of records uploaded.
    pub records_uploaded: u64,
    /// Total number of remote deletions acknowledged.
    pub records_deleted: u64,
    /// Total number of records the server reported as changed during upload.
    pub conflicts_encountered: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCycleResult {
    /// Records imported.
    pub downloaded: u64,
    /// Remote deletions applied locally.
    pub remote_deletions: u64,
    /// Records uploaded.
    pub uploaded: u64,
    /// Local deletions acknowledged remotely.
    pub deleted: u64,
    /// Push conflicts imported.
    pub conflicts: u64,
    /// Zones synchronized.
    pub zones: usize,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    pub(crate) fn absorb(&mut self, other: &SyncCycleResult) {
        self.downloaded += other.downloaded;
        self.remote_deletions += other.remote_deletions;
        self.uploaded += other.uploaded;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(!CycleState::Idle.is_active());
        assert!(!CycleState::Error.is_active());
        assert!(!CycleState::Cancelled.is_active());
        assert!(CycleState::FetchingChanges.is_active());
        assert!(CycleState::Finalizing.is_active());
    }

    #[test]
    fn absorb_sums_counts() {
        let mut total = SyncCycleResult::default();
        total.absorb(&SyncCycleResult {
            downloaded: 2,
            uploaded: 1,
            ..Default::default()
        });
        total.absorb(&SyncCycleResult {
            downloaded: 3,
            deleted: 4,
            ..Default::default()
        });
        assert_eq!(total.downloaded, 5);
        assert_eq!(total.uploaded, 1);
        assert_eq!(total.deleted, 4);
    }
}
