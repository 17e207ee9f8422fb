//! Push outcomes and subscriptions.

use crate::ids::{RecordId, SubscriptionId, ZoneId};
use crate::record::RemoteRecord;

/// Why a single record in a push was not saved.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFailure {
    /// Record that failed.
    pub id: RecordId,
    /// Server-side reason.
    pub reason: String,
}

/// Per-record result of a push.
///
/// A record appears in exactly one of the three lists.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PushOutcome {
    /// Records saved, carrying their new server change tags.
    pub saved: Vec<RemoteRecord>,
    /// Current server versions of records whose push carried a stale tag.
    pub conflicts: Vec<RemoteRecord>,
    /// Records rejected for other reasons.
    pub failed: Vec<PushFailure>,
}

impl PushOutcome {
    /// Creates an outcome where every record was saved.
    pub fn saved(records: Vec<RemoteRecord>) -> Self {
        Self {
            saved: records,
            ..Self::default()
        }
    }

    /// Returns true if nothing conflicted or failed.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }
}

/// A remote change subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Zone watched, or `None` for a database-wide subscription.
    pub zone: Option<ZoneId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_outcome() {
        let outcome = PushOutcome::saved(Vec::new());
        assert!(outcome.is_clean());

        let mut outcome = PushOutcome::default();
        outcome.failed.push(PushFailure {
            id: RecordId::new(ZoneId::new("z"), "a"),
            reason: "quota".into(),
        });
        assert!(!outcome.is_clean());
    }
}
