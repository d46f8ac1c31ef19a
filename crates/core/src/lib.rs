//! changekit core library.
//!
//! A change-control kernel: a content-addressed snapshot store, an
//! append-only change log, branches whose state is a per-entity pointer
//! table, an idempotent merge-intent graph between branches, and a conflict
//! engine that clusters disagreeing changes under stable keys.
//!
//! Every operation is available as a free function over `&rusqlite::Connection`
//! that joins whatever transaction the caller holds (or opens one on an
//! autocommit connection), and as a method on [`Database`] that runs it
//! atomically on its own.

pub mod branch;
pub mod change;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod models;
pub mod snapshot;

// Re-exports for convenience.
pub use config::KernelConfig;
pub use db::Database;
pub use errors::{CoreError, DatabaseError};
pub use models::{
    Branch, BranchChangePointer, Change, ChangeConflict, MergeIntent, NewChange, Snapshot,
    NO_CONTENT_SNAPSHOT_ID,
};
