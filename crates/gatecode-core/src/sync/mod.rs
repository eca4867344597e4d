//! Sync orchestration
//!
//! Ties the local store to the remote replica:
//!
//! 1. Subscribe to remote snapshots, usage and `last_sync`
//! 2. Push a one-time catch-up of the local state
//! 3. Merge every remote update through the merge engine
//! 4. Push local changes through a coalescing deferred push
//! 5. Poll on two timers as a fallback for missed deliveries
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::open(config)?;
//! engine.start().await;
//! let record = engine.generate_code().await?;
//! engine.stop().await;
//! ```

mod engine;
mod poller;
mod state;

pub use engine::{EngineStatus, SyncEngine, MEMORY_REMOTE};
pub use state::{EngineEvent, SyncState};
