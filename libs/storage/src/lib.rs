//! Keyed state storage for Flowline partitions
//!
//! [`StateDb`] holds the processing state of one partition as ordered column
//! families. All writes go through a [`Transaction`] that is committed
//! atomically; [`TypedColumn`] adds typed keys and values on top. The state
//! is kept in memory and rebuilt from the latest [`FileSnapshotStore`]
//! snapshot plus the replicated log.

mod column;
mod db;
mod error;
mod snapshot;

pub use column::{DbKey, TypedColumn};
pub use db::{ColumnId, ReadContext, ScanIter, StateDb, Transaction};
pub use error::{Result, StorageError};
pub use snapshot::{FileSnapshotStore, PersistedSnapshot, SnapshotMetadata};
