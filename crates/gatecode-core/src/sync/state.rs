//! Sync lifecycle state and engine events

use std::fmt;

use serde::Serialize;

/// Where the engine is in its sync lifecycle
///
/// ```text
/// Uninitialized → Connecting → Synced
///                            ↘ Degraded → (poll) → Synced
/// Uninitialized → LocalOnly  (no remote configured)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Not started, or stopped
    Uninitialized,
    /// Establishing the remote subscription
    Connecting,
    /// Subscribed and caught up with the remote replica
    Synced,
    /// Remote unreachable; running on the local store until a poll recovers
    Degraded,
    /// No remote configured
    LocalOnly,
}

impl SyncState {
    /// Whether remote pushes are worth attempting
    pub fn can_push(&self) -> bool {
        matches!(self, SyncState::Connecting | SyncState::Synced)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Connecting => write!(f, "connecting"),
            Self::Synced => write!(f, "synced"),
            Self::Degraded => write!(f, "degraded"),
            Self::LocalOnly => write!(f, "local-only"),
        }
    }
}

/// Notifications for collaborators of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The local code set changed since it was last observed
    CodesChanged {
        timestamp: Option<String>,
        count: usize,
    },
    /// The sync lifecycle moved
    StateChanged(SyncState),
}
