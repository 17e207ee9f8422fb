//! Durable key-value configuration store.
//!
//! Holds the device identifier, change tokens and subscription ids. Values
//! are strings or booleans.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Minimal get/set/remove store for strings and booleans.
///
/// Implementations must survive process restarts to be useful outside tests.
pub trait KeyValueStore: Send + Sync {
    /// Returns the string stored under `key`.
    fn string(&self, key: &str) -> SyncResult<Option<String>>;

    /// Returns the boolean stored under `key`, `false` when absent.
    fn bool(&self, key: &str) -> SyncResult<bool>;

    /// Stores a string.
    fn set_string(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Stores a boolean.
    fn set_bool(&self, key: &str, value: bool) -> SyncResult<()>;

    /// Removes a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> SyncResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StoredValue {
    Text(String),
    Bool(bool),
}

/// An in-memory key-value store for testing.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn string(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(match self.values.read().get(key) {
            Some(StoredValue::Text(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn bool(&self, key: &str) -> SyncResult<bool> {
        Ok(matches!(
            self.values.read().get(key),
            Some(StoredValue::Bool(true))
        ))
    }

    fn set_string(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values
            .write()
            .insert(key.to_string(), StoredValue::Text(value.to_string()));
        Ok(())
    }

    fn set_bool(&self, key: &str, value: bool) -> SyncResult<()> {
        self.values
            .write()
            .insert(key.to_string(), StoredValue::Bool(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// A key-value store persisted to a single CBOR file.
///
/// Every write rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, StoredValue>>,
}

impl FileKeyValueStore {
    /// Opens the store at `path`, creating it on first write.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => ciborium::from_reader(bytes.as_slice())
                .map_err(|e| SyncError::persistence(format!("corrupt key-value file: {e}")))?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<F>(&self, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, StoredValue>),
    {
        let mut values = self.values.write();
        let mut next = values.clone();
        f(&mut next);

        let mut bytes = Vec::new();
        ciborium::into_writer(&next, &mut bytes)
            .map_err(|e| SyncError::persistence(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;

        *values = next;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn string(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(match self.values.read().get(key) {
            Some(StoredValue::Text(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn bool(&self, key: &str) -> SyncResult<bool> {
        Ok(matches!(
            self.values.read().get(key),
            Some(StoredValue::Bool(true))
        ))
    }

    fn set_string(&self, key: &str, value: &str) -> SyncResult<()> {
        self.mutate(|values| {
            values.insert(key.to_string(), StoredValue::Text(value.to_string()));
        })
    }

    fn set_bool(&self, key: &str, value: bool) -> SyncResult<()> {
        self.mutate(|values| {
            values.insert(key.to_string(), StoredValue::Bool(value));
        })
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        if !self.values.read().contains_key(key) {
            return Ok(());
        }
        self.mutate(|values| {
            values.remove(key);
        })
    }
}

/// Writes `bytes` to `path` via a temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
