//! Pending relationship ledger.
//!
//! An imported record may reference a target that has not been materialized
//! locally yet (it may arrive on a later page, or in a later cycle). Such
//! links are parked here as edges and applied as soon as the target exists.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A relationship edge waiting for its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelationship {
    /// Identifier of the object owning the relationship field.
    pub owner: String,
    /// Relationship field name on the owner.
    pub name: String,
    /// Identifier of the not yet resolved target.
    pub target: String,
}

/// Arena of pending edges indexed by target identifier.
#[derive(Debug, Clone, Default)]
pub struct RelationshipLedger {
    edges: BTreeMap<u64, PendingRelationship>,
    by_target: HashMap<String, Vec<u64>>,
    next_id: u64,
}

impl RelationshipLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from persisted edges.
    pub fn from_edges(edges: impl IntoIterator<Item = PendingRelationship>) -> Self {
        let mut ledger = Self::new();
        for edge in edges {
            ledger.push(edge);
        }
        ledger
    }

    /// Queues an edge. An existing edge for the same owner field is replaced.
    pub fn add(
        &mut self,
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
    ) {
        let edge = PendingRelationship {
            owner: owner.into(),
            name: name.into(),
            target: target.into(),
        };
        self.remove_where(|e| e.owner == edge.owner && e.name == edge.name);
        self.push(edge);
    }

    fn push(&mut self, edge: PendingRelationship) {
        let id = self.next_id;
        self.next_id += 1;
        self.by_target.entry(edge.target.clone()).or_default().push(id);
        self.edges.insert(id, edge);
    }

    /// Removes and returns every edge waiting on `target`.
    pub fn take_for_target(&mut self, target: &str) -> Vec<PendingRelationship> {
        let ids = self.by_target.remove(target).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.edges.remove(&id))
            .collect()
    }

    /// Drops an owner field's edge, if any (the field was set directly).
    pub fn remove_field(&mut self, owner: &str, name: &str) {
        self.remove_where(|e| e.owner == owner && e.name == name);
    }

    /// Drops every edge owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: &str) {
        self.remove_where(|e| e.owner == owner);
    }

    fn remove_where<F>(&mut self, predicate: F)
    where
        F: Fn(&PendingRelationship) -> bool,
    {
        let doomed: Vec<u64> = self
            .edges
            .iter()
            .filter(|(_, e)| predicate(e))
            .map(|(id, _)| *id)
            .collect();

        for id in doomed {
            if let Some(edge) = self.edges.remove(&id) {
                if let Some(ids) = self.by_target.get_mut(&edge.target) {
                    ids.retain(|i| *i != id);
                    if ids.is_empty() {
                        self.by_target.remove(&edge.target);
                    }
                }
            }
        }
    }

    /// Returns true if `owner` still waits on any target.
    pub fn has_pending_for(&self, owner: &str) -> bool {
        self.edges.values().any(|e| e.owner == owner)
    }

    /// Returns the distinct identifiers edges are waiting on.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.by_target.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Iterates edges in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingRelationship> {
        self.edges.values()
    }

    /// Returns the number of edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if no edge is pending.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Removes every edge.
    pub fn clear(&mut self) {
        self.edges.clear();
        self.by_target.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn take_for_target_resolves_all_waiters() {
        let mut ledger = RelationshipLedger::new();
        ledger.add("Note.1", "folder", "Folder.1");
        ledger.add("Note.2", "folder", "Folder.1");
        ledger.add("Note.3", "folder", "Folder.2");

        let resolved = ledger.take_for_target("Folder.1");
        assert_eq!(resolved.len(), 2);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.targets(), ["Folder.2"]);
        assert!(ledger.take_for_target("Folder.1").is_empty());
    }

    #[test]
    fn re_adding_an_owner_field_replaces_target() {
        let mut ledger = RelationshipLedger::new();
        ledger.add("Note.1", "folder", "Folder.1");
        ledger.add("Note.1", "folder", "Folder.9");

        assert_eq!(ledger.len(), 1);
        assert!(ledger.take_for_target("Folder.1").is_empty());
        assert_eq!(ledger.take_for_target("Folder.9").len(), 1);
    }

    #[test]
    fn removing_owner_drops_its_edges() {
        let mut ledger = RelationshipLedger::new();
        ledger.add("Note.1", "folder", "Folder.1");
        ledger.add("Note.1", "author", "User.1");
        ledger.add("Note.2", "folder", "Folder.1");

        ledger.remove_owned_by("Note.1");
        assert!(!ledger.has_pending_for("Note.1"));
        assert!(ledger.has_pending_for("Note.2"));
        assert_eq!(ledger.targets(), ["Folder.1"]);
    }

    #[test]
    fn persisted_edges_rebuild_index() {
        let mut ledger = RelationshipLedger::new();
        ledger.add("a", "r", "t");
        let edges: Vec<_> = ledger.iter().cloned().collect();

        let mut restored = RelationshipLedger::from_edges(edges);
        assert_eq!(restored.take_for_target("t").len(), 1);
    }

    proptest! {
        #[test]
        fn index_matches_edges(ops in prop::collection::vec((0u8..4, 0u8..2, 0u8..4, 0u8..3), 0..50)) {
            let mut ledger = RelationshipLedger::new();
            for (owner, name, target, kind) in ops {
                let owner = format!("o{owner}");
                let target = format!("t{target}");
                match kind {
                    0 => ledger.add(owner, format!("n{name}"), target),
                    1 => { ledger.take_for_target(&target); }
                    _ => ledger.remove_owned_by(&owner),
                }
            }

            let mut from_edges: Vec<String> = ledger.iter().map(|e| e.target.clone()).collect();
            from_edges.sort();
            from_edges.dedup();
            prop_assert_eq!(ledger.targets(), from_edges);

            let mut seen = std::collections::HashSet::new();
            for edge in ledger.iter() {
                prop_assert!(seen.insert((edge.owner.clone(), edge.name.clone())));
            }
        }
    }
}
