//! Change-feed pages returned by the remote service.

use crate::ids::{ChangeToken, RecordId, ZoneId};
use crate::record::RemoteRecord;

/// One page of the database-level feed: which zones changed or vanished.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseChanges {
    /// Zones with record changes since the request token.
    pub changed_zones: Vec<ZoneId>,
    /// Zones deleted since the request token.
    pub deleted_zones: Vec<ZoneId>,
    /// Token covering this page.
    pub token: Option<ChangeToken>,
    /// Whether another page is available.
    pub more_coming: bool,
}

impl DatabaseChanges {
    /// Returns true if the page reports no zone activity.
    pub fn is_empty(&self) -> bool {
        self.changed_zones.is_empty() && self.deleted_zones.is_empty()
    }
}

/// One page of a zone's record feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChanges {
    /// Zone the page belongs to.
    pub zone: ZoneId,
    /// Records created or modified since the request token.
    pub records: Vec<RemoteRecord>,
    /// Records deleted since the request token.
    pub deleted: Vec<RecordId>,
    /// Token to persist once this page is durably applied.
    pub token: ChangeToken,
    /// Whether another page is available.
    pub more_coming: bool,
}

impl ZoneChanges {
    /// Creates an empty final page.
    pub fn empty(zone: ZoneId, token: ChangeToken) -> Self {
        Self {
            zone,
            records: Vec::new(),
            deleted: Vec::new(),
            token,
            more_coming: false,
        }
    }

    /// Returns true if the page carries no records or deletions.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deleted.is_empty()
    }

    /// Returns the number of changes on this page.
    pub fn len(&self) -> usize {
        self.records.len() + self.deleted.len()
    }
}
