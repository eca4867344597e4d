//! Intra-device broadcast
//!
//! Fans change notifications out to every other execution context on this
//! device (other engines, UI tasks, watchers). It never leaves the device.
//!
//! Publishing is best-effort: with nobody listening the message is dropped
//! after a warning. Every publish advances the sync timestamp and requests a
//! deferred remote push, so a local change is never left un-replicated.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::storage::SyncClock;

/// Capacity of the fan-out channel; slow listeners lag rather than block
const CHANNEL_CAPACITY: usize = 64;

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastAction {
    CodesUpdated,
    CodeVerified,
    CodeDeleted,
    CodesCleared,
    CodesImported,
    RemoteMerged,
}

impl fmt::Display for BroadcastAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BroadcastAction::CodesUpdated => "CODES_UPDATED",
            BroadcastAction::CodeVerified => "CODE_VERIFIED",
            BroadcastAction::CodeDeleted => "CODE_DELETED",
            BroadcastAction::CodesCleared => "CODES_CLEARED",
            BroadcastAction::CodesImported => "CODES_IMPORTED",
            BroadcastAction::RemoteMerged => "REMOTE_MERGED",
        };
        f.write_str(name)
    }
}

/// A change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub action: BroadcastAction,
    pub data: serde_json::Value,
    pub timestamp: String,
}

/// Device-scoped fan-out channel
#[derive(Clone)]
pub struct Broadcast {
    tx: broadcast::Sender<BroadcastMessage>,
    clock: SyncClock,
    push_tx: Arc<watch::Sender<u64>>,
    warned_no_listeners: Arc<AtomicBool>,
}

impl Broadcast {
    /// Create a channel that stamps messages with the given clock
    pub fn new(clock: SyncClock) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (push_tx, _) = watch::channel(0);
        Self {
            tx,
            clock,
            push_tx: Arc::new(push_tx),
            warned_no_listeners: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listen for messages published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    /// Watch deferred push requests
    ///
    /// The value is a generation counter; several publishes between two
    /// reads coalesce into one change.
    pub fn push_requests(&self) -> watch::Receiver<u64> {
        self.push_tx.subscribe()
    }

    /// The clock stamping this channel's messages
    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    /// Publish a change; never fails
    pub fn publish(&self, action: BroadcastAction, data: serde_json::Value) -> BroadcastMessage {
        let timestamp = self.clock.advance();
        let message = BroadcastMessage {
            action,
            data,
            timestamp,
        };

        match self.tx.send(message.clone()) {
            Ok(listeners) => debug!("Broadcast {} to {} listener(s)", action, listeners),
            Err(_) => {
                // Only the first miss is worth a warning
                if !self.warned_no_listeners.swap(true, Ordering::Relaxed) {
                    warn!("No broadcast listeners on this device; {} not delivered", action);
                } else {
                    debug!("No broadcast listeners for {}", action);
                }
            }
        }

        self.push_tx.send_modify(|generation| *generation += 1);
        message
    }
}
