//! # zonesync Engine
//!
//! Keeps a local object store and a remote record service consistent.
//!
//! This crate provides:
//! - Per-object tracking records and their sync state machine
//! - A pending relationship ledger for references to objects not yet imported
//! - The `ModelAdapter` contract and a reference adapter over an `ObjectStore`
//! - Server-wins, client-wins and delegate-driven conflict resolution
//! - Durable change tokens, device identity and subscription bookkeeping
//! - A zone registry fed by an `AdapterProvider`
//! - The async sync cycle with retry, adaptive batch sizes and cancellation
//!
//! ## Architecture
//!
//! A cycle is **pull-then-push**, per zone:
//! 1. Fetch change pages since the stored zone token
//! 2. Import, resolve pending relationships and commit each page
//! 3. Persist the page token only after the commit succeeded
//! 4. Upload local changes, then local deletions
//! 5. Re-read the feed so the token moves past this device's own uploads
//!
//! Zones run concurrently; each zone is strictly sequential.
//!
//! ## Key Invariants
//!
//! - A token never advances past changes that are not durably applied
//! - Upload batches come out in insertion order, so retries are deterministic
//! - A failed cycle leaves tracking state as of the last committed step
//! - At most one cycle runs per engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod config;
mod engine;
mod error;
mod events;
mod kv;
mod object_store;
mod pending;
mod registry;
mod remote;
mod state;
mod state_store;
mod store_adapter;
mod tokens;
mod tracking;

pub use adapter::{ConflictDelegate, FieldConflict, KeepLocalDelegate, ModelAdapter};
pub use config::{
    RetryConfig, SyncConfig, SyncMode, DEFAULT_BATCH_SIZE, DEVICE_ID_FIELD, MODEL_VERSION_FIELD,
};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use object_store::{LocalObject, MemoryObjectStore, ObjectStore, ObjectWrite};
pub use pending::{PendingRelationship, RelationshipLedger};
pub use registry::{AdapterProvider, ZoneRegistry};
pub use remote::{RemoteError, RemoteResult, RemoteService};
pub use state::{CycleState, SyncCycleResult, SyncStats};
pub use state_store::{FileStateStore, MemoryStateStore, StateStore, TrackingSnapshot};
pub use store_adapter::ObjectStoreAdapter;
pub use tokens::{TokenStore, ZoneTokens};
pub use tracking::{EntityState, TrackingRecord, TrackingTable};
