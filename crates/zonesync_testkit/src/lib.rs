//! # zonesync Testkit
//!
//! Test utilities for zonesync.
//!
//! This crate provides:
//! - [`ServerRemote`], a `RemoteService` over an in-process `SyncServer`
//!   with fault injection and call accounting
//! - Device and zone fixtures backed by in-memory stores
//! - A state store that fails on demand, for commit failure scenarios
//! - Property-based generators for fields and objects
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zonesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_devices_converge() {
//!     let remote = ServerRemote::default();
//!     let a = TestDevice::new("a", remote.clone());
//!     let b = TestDevice::new("b", remote);
//!     // ... insert on `a`, synchronize both, compare
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;
