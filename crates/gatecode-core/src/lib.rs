//! Gatecode Core Library
//!
//! This crate provides the core functionality for Gatecode, a
//! multi-replica access-code synchronization engine: single-use codes are
//! issued and redeemed on any device, and every device converges on which
//! codes exist and which have been used.
//!
//! # Architecture
//!
//! - **Local store**: the device's full code set, usage ledger and sync
//!   timestamp, stored as JSON files
//! - **Broadcast**: change notifications for other tasks on the same device
//! - **Remote replica**: a shared key/value store every device pushes its
//!   snapshot and usage facts to
//! - **Merge**: deterministic, idempotent reconciliation; `used` never reverts
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.start().await;
//!
//! let record = engine.generate_code().await?;
//! let outcome = engine.verify_code(&record.code).await;
//! assert!(outcome.success);
//! ```
//!
//! # Modules
//!
//! - `codes`: Code operations (main entry point, on `SyncEngine`)
//! - `models`: Code records, usage entries and normalization
//! - `store`: Local store
//! - `broadcast`: Intra-device change notifications
//! - `remote`: Remote replica client and transports
//! - `merge`: Merge engine
//! - `sync`: Sync orchestrator
//! - `storage`: File persistence and the sync clock
//! - `config`: Application configuration

pub mod broadcast;
pub mod codes;
pub mod config;
pub mod device;
pub mod error;
pub mod merge;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

pub use broadcast::{Broadcast, BroadcastAction, BroadcastMessage};
pub use codes::{decode_export, export_codes, ImportSummary, VerifyOutcome};
pub use config::Config;
pub use device::Device;
pub use error::{CodeError, CodeResult};
pub use models::{CodeRecord, UsageEntry, UsageLedger};
pub use remote::{MemoryTransport, RemoteClient, RemoteError, RemoteTransport};
pub use storage::{StorageError, StorageStats};
pub use store::{CodeStats, LocalStore};
pub use sync::{EngineEvent, EngineStatus, SyncEngine, SyncState};
