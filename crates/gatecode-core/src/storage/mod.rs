//! Storage layer
//!
//! Handles the device-resident files behind the Local Store.
//!
//! ## Architecture
//!
//! - **Persistence**: JSON files written atomically (temp file + rename)
//! - **Clock**: the sync timestamp, advanced on every local change
//!
//! Corrupt files are reported as [`StorageError::Corrupt`]; the Local Store
//! decides to treat them as empty.

pub mod clock;
pub mod error;
pub mod persistence;

pub use clock::SyncClock;
pub use error::{IoOp, StorageError, StorageResult};
pub use persistence::{FilePersistence, StorageStats};
