//! Local object store boundary.
//!
//! The engine never touches domain objects directly. The reference adapter
//! reads and writes them through [`ObjectStore`], which any embedded
//! database or ORM can implement.

use crate::error::SyncResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zonesync_protocol::{FieldMap, FieldValue};

/// A domain object as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalObject {
    /// Stable identifier, unique within the zone.
    pub identifier: String,
    /// Schema discriminator.
    pub entity_type: String,
    /// Field values. Relationships are stored as `FieldValue::Reference`.
    pub fields: FieldMap,
}

impl LocalObject {
    /// Creates an object with no fields.
    pub fn new(identifier: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            entity_type: entity_type.into(),
            fields: FieldMap::new(),
        }
    }

    /// Adds a field (builder style).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Gets a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// A single write in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectWrite {
    /// Insert or replace an object.
    Put(LocalObject),
    /// Remove an object by identifier. Removing an absent object is a no-op.
    Delete(String),
}

impl ObjectWrite {
    /// Returns the identifier the write targets.
    pub fn identifier(&self) -> &str {
        match self {
            ObjectWrite::Put(object) => &object.identifier,
            ObjectWrite::Delete(identifier) => identifier,
        }
    }
}

/// Storage for domain objects of one zone.
pub trait ObjectStore: Send + Sync {
    /// Reads an object.
    fn get(&self, identifier: &str) -> SyncResult<Option<LocalObject>>;

    /// Returns true if the object exists.
    fn contains(&self, identifier: &str) -> SyncResult<bool> {
        Ok(self.get(identifier)?.is_some())
    }

    /// Applies a batch of writes atomically: all of them or none.
    fn apply(&self, writes: Vec<ObjectWrite>) -> SyncResult<()>;

    /// Lists every stored identifier in ascending order.
    fn identifiers(&self) -> SyncResult<Vec<String>>;
}

/// An in-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, LocalObject>>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, identifier: &str) -> SyncResult<Option<LocalObject>> {
        Ok(self.objects.read().get(identifier).cloned())
    }

    fn apply(&self, writes: Vec<ObjectWrite>) -> SyncResult<()> {
        let mut objects = self.objects.write();
        for write in writes {
            match write {
                ObjectWrite::Put(object) => {
                    objects.insert(object.identifier.clone(), object);
                }
                ObjectWrite::Delete(identifier) => {
                    objects.remove(&identifier);
                }
            }
        }
        Ok(())
    }

    fn identifiers(&self) -> SyncResult<Vec<String>> {
        Ok(self.objects.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_puts_and_deletes() {
        let store = MemoryObjectStore::new();
        store
            .apply(vec![
                ObjectWrite::Put(LocalObject::new("a", "Note").with_field("title", "A")),
                ObjectWrite::Put(LocalObject::new("b", "Note")),
            ])
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("a").unwrap());

        store
            .apply(vec![
                ObjectWrite::Delete("a".into()),
                ObjectWrite::Delete("missing".into()),
            ])
            .unwrap();
        assert_eq!(store.identifiers().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn later_write_wins_within_batch() {
        let store = MemoryObjectStore::new();
        store
            .apply(vec![
                ObjectWrite::Put(LocalObject::new("a", "Note").with_field("v", 1i64)),
                ObjectWrite::Put(LocalObject::new("a", "Note").with_field("v", 2i64)),
            ])
            .unwrap();
        let object = store.get("a").unwrap().unwrap();
        assert_eq!(object.field("v"), Some(&FieldValue::Integer(2)));
    }

    #[test]
    fn write_identifier() {
        assert_eq!(ObjectWrite::Delete("x".into()).identifier(), "x");
        assert_eq!(
            ObjectWrite::Put(LocalObject::new("y", "Note")).identifier(),
            "y"
        );
    }
}
