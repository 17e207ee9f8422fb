//! # zonesync Protocol
//!
//! Record, zone and change-feed types shared by the sync engine and the
//! remote record service.
//!
//! This crate provides:
//! - `ZoneId`, `RecordId`, `ChangeToken` identifiers
//! - `RemoteRecord` and its `FieldValue` map
//! - Change-feed pages (`DatabaseChanges`, `ZoneChanges`)
//! - Push outcomes and subscriptions
//! - `MergePolicy` and field-level diffs for conflict resolution
//! - CBOR encoding of records
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod conflict;
mod error;
mod ids;
mod messages;
mod record;

pub use change_feed::{DatabaseChanges, ZoneChanges};
pub use conflict::{FieldChanges, MergePolicy};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ChangeToken, RecordId, SubscriptionId, ZoneId};
pub use messages::{PushFailure, PushOutcome, Subscription};
pub use record::{FieldMap, FieldValue, RemoteRecord};
