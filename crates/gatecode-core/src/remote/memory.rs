//! In-process remote store
//!
//! Several engines can share one hub to behave like devices talking to the
//! same realtime store. Each handle can be taken offline or made to fail
//! writes independently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::{RemoteError, RemoteResult};
use super::transport::{matches_prefix, RemoteEvent, RemoteTransport};

struct Subscriber {
    prefix: String,
    online: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

#[derive(Default)]
struct Hub {
    entries: Mutex<BTreeMap<String, Value>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Hub {
    fn notify(&self, path: &str, value: &Value) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if !matches_prefix(path, &sub.prefix) || !sub.online.load(Ordering::SeqCst) {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(RemoteEvent {
                    path: path.to_string(),
                    value: value.clone(),
                })
                .is_ok()
        });
    }
}

/// Handle onto a shared in-memory store
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    online: Arc<AtomicBool>,
    failing_writes: Arc<AtomicU32>,
    writes: Arc<AtomicU64>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a fresh, empty hub
    pub fn new() -> Self {
        Self::attach(Arc::new(Hub::default()))
    }

    fn attach(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            online: Arc::new(AtomicBool::new(true)),
            failing_writes: Arc::new(AtomicU32::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Another handle onto the same hub, with its own connectivity
    pub fn peer(&self) -> Self {
        Self::attach(self.hub.clone())
    }

    /// Simulate losing or regaining connectivity
    ///
    /// Events published while offline are not delivered to this handle.
    pub fn set_online(&self, online: bool) {
        debug!("Memory transport {}", if online { "online" } else { "offline" });
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make the next `count` writes through this handle fail
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Successful writes made through this handle
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of the whole hub
    pub fn dump(&self) -> BTreeMap<String, Value> {
        self.hub
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ensure_online(&self) -> RemoteResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("memory transport offline".into()))
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        self.ensure_online()?;
        if self.take_injected_failure() {
            return Err(RemoteError::Unavailable("injected write failure".into()));
        }

        self.hub
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.hub.notify(path, &value);
        Ok(())
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        self.ensure_online()?;
        let entries = self.hub.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> RemoteResult<Vec<(String, Value)>> {
        self.ensure_online()?;
        let entries = self.hub.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|(path, _)| matches_prefix(path, prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn subscribe(&self, prefix: &str) -> RemoteResult<mpsc::UnboundedReceiver<RemoteEvent>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Hold the subscriber list while replaying so no write slips between
        // the replay and the registration
        let mut subscribers = self.hub.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        {
            let entries = self.hub.entries.lock().unwrap_or_else(|e| e.into_inner());
            for (path, value) in entries.iter().filter(|(p, _)| matches_prefix(p, prefix)) {
                let _ = tx.send(RemoteEvent {
                    path: path.clone(),
                    value: value.clone(),
                });
            }
        }
        subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            online: self.online.clone(),
            tx,
        });

        Ok(rx)
    }
}
