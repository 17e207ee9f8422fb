//! # zonesync Server
//!
//! An in-process record service that speaks the zonesync data model.
//!
//! The server keeps records in named zones, hands out opaque change tokens
//! and pages changes to whoever asks. It is what the engine's integration
//! tests sync against, and it doubles as a reference for the behavior a
//! production [`RemoteService`](https://docs.rs/zonesync_engine) binding is
//! expected to have.
//!
//! ## Features
//!
//! - Per-zone change feeds with resumable, opaque tokens
//! - Database feed listing changed and deleted zones
//! - Optimistic concurrency through change tags
//! - Partial saves: `Null` fields remove the stored value
//! - Subscriptions per zone or for the whole database
//!
//! ## Example
//!
//! ```rust
//! use zonesync_protocol::{RecordId, RemoteRecord, ZoneId};
//! use zonesync_server::{ServerConfig, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::default());
//! let zone = ZoneId::new("notes");
//! server.create_zone(&zone);
//!
//! let note = RemoteRecord::new(RecordId::new(zone.clone(), "Note.1"), "Note")
//!     .with_field("title", "hello");
//! let outcome = server.push_records(&zone, vec![note]).unwrap();
//! assert_eq!(outcome.saved.len(), 1);
//!
//! let page = server.fetch_zone_changes(&zone, None, 10).unwrap();
//! assert_eq!(page.records.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod change_log;
mod config;
mod error;
mod server;
mod zone_log;

pub use change_log::{ChangeLog, LogPage};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::SyncServer;
pub use zone_log::ZoneLog;
