//! Sequence-ordered change log.
//!
//! Every touch of a key moves it to the end of the log under a fresh
//! sequence number, so a reader resuming from sequence `n` sees each key
//! changed after `n` exactly once, in the order of its latest change.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// One page read from a [`ChangeLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage<K> {
    /// Keys changed after the requested sequence, oldest first.
    pub keys: Vec<K>,
    /// Sequence to resume from.
    pub cursor: u64,
    /// Whether more keys follow `cursor`.
    pub more_coming: bool,
}

/// Append-only view of changed keys, compacted to one entry per key.
#[derive(Debug, Clone)]
pub struct ChangeLog<K> {
    entries: BTreeMap<u64, K>,
    positions: HashMap<K, u64>,
    last_seq: u64,
}

impl<K: Clone + Eq + Hash> ChangeLog<K> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            positions: HashMap::new(),
            last_seq: 0,
        }
    }

    /// Highest sequence handed out so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of distinct keys in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was ever logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a change to `key` and returns its new sequence.
    pub fn touch(&mut self, key: K) -> u64 {
        self.last_seq += 1;
        if let Some(previous) = self.positions.insert(key.clone(), self.last_seq) {
            self.entries.remove(&previous);
        }
        self.entries.insert(self.last_seq, key);
        self.last_seq
    }

    /// Reads up to `limit` keys changed after `after`.
    pub fn since(&self, after: u64, limit: usize) -> LogPage<K> {
        let limit = limit.max(1);
        let mut keys = Vec::new();
        let mut cursor = after;
        for (seq, key) in self.entries.range(after.saturating_add(1)..).take(limit) {
            keys.push(key.clone());
            cursor = *seq;
        }
        if keys.is_empty() {
            cursor = cursor.max(self.last_seq);
        }
        let more_coming = self
            .entries
            .range(cursor.saturating_add(1)..)
            .next()
            .is_some();
        LogPage {
            keys,
            cursor,
            more_coming,
        }
    }
}

impl<K: Clone + Eq + Hash> Default for ChangeLog<K> {
    fn default() -> Self {
        Self::new()
    }
}
