//! Remote replica client
//!
//! Speaks the shared layout of the remote store on top of any
//! [`RemoteTransport`]:
//!
//! - `snapshots/<deviceId>` full code set pushed by one device
//! - `master_usage/<CODE>` one usage fact per redeemed code
//! - `last_sync` timestamp of the latest snapshot push
//! - `devices/<deviceId>` presence bookkeeping
//!
//! Each device only ever overwrites its own snapshot. Writes go through the
//! shared [`RetryPolicy`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::RemoteResult;
use super::retry::RetryPolicy;
use super::transport::{RemoteEvent, RemoteTransport};
use crate::device::Device;
use crate::models::{
    normalize, normalize_code, now_iso, CodeRecord, RawCodeRecord, UsageEntry, UsageLedger,
};

pub const SNAPSHOTS_PREFIX: &str = "snapshots/";
pub const USAGE_PREFIX: &str = "master_usage/";
pub const LAST_SYNC_PATH: &str = "last_sync";
pub const DEVICES_PREFIX: &str = "devices/";

/// One device's full code set as stored remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub platform: String,
    pub codes: Vec<CodeRecord>,
    pub updated_at: String,
}

impl DeviceSnapshot {
    /// Parse a snapshot received at `path`, normalizing every record
    ///
    /// Records that fail normalization are dropped. A missing `deviceId`
    /// falls back to the last path segment.
    pub fn from_remote(path: &str, value: Value) -> RemoteResult<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire {
            #[serde(default)]
            device_id: Option<String>,
            #[serde(default)]
            platform: String,
            #[serde(default)]
            codes: Vec<Value>,
            #[serde(default)]
            updated_at: Option<String>,
        }

        let wire: Wire = serde_json::from_value(value)?;
        let device_id = wire
            .device_id
            .unwrap_or_else(|| path.trim_start_matches(SNAPSHOTS_PREFIX).to_string());

        let codes = wire
            .codes
            .into_iter()
            .filter_map(|raw| {
                let parsed = serde_json::from_value::<RawCodeRecord>(raw)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| normalize(raw).map_err(|e| e.to_string()));
                match parsed {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("Dropping invalid record from {}: {}", device_id, e);
                        None
                    }
                }
            })
            .collect();

        Ok(Self {
            device_id,
            platform: wire.platform,
            codes,
            updated_at: wire.updated_at.unwrap_or_default(),
        })
    }
}

/// Presence record of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePresence {
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
    pub last_seen: String,
}

/// A change delivered by a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteUpdate {
    /// Another device pushed its snapshot
    Snapshot(DeviceSnapshot),
    /// Usage facts changed
    Usage(UsageLedger),
    /// `last_sync` moved
    Timestamp(String),
}

/// Everything readable from the remote store in one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteState {
    /// Snapshots of other devices
    pub snapshots: Vec<DeviceSnapshot>,
    pub usage: UsageLedger,
    pub last_sync: Option<String>,
}

impl RemoteState {
    /// Union of every snapshot's records, merged in order
    pub fn all_codes(&self) -> Vec<CodeRecord> {
        self.snapshots.iter().fold(Vec::new(), |acc, snapshot| {
            crate::merge::merge(&acc, &snapshot.codes)
        })
    }
}

/// Live listeners on the remote store
///
/// Dropping the subscription tears it down as well.
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Stop listening; calling this more than once is harmless
    pub fn unsubscribe(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Whether any listener is still running
    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Client for the shared remote replica
#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn RemoteTransport>,
    device: Device,
    retry: RetryPolicy,
}

impl RemoteClient {
    pub fn new(transport: Arc<dyn RemoteTransport>, device: Device) -> Self {
        Self {
            transport,
            device,
            retry: RetryPolicy::default(),
        }
    }

    /// Use a different retry policy for writes
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    async fn write(&self, path: &str, value: Value) -> RemoteResult<()> {
        self.retry
            .run(path, || self.transport.set(path, value.clone()))
            .await
    }

    // ==================== Writes ====================

    /// Overwrite this device's snapshot, then bump `last_sync`
    ///
    /// Returns the `updatedAt` stamped on the snapshot.
    pub async fn push_snapshot(&self, records: &[CodeRecord]) -> RemoteResult<String> {
        let updated_at = now_iso();
        self.push_snapshot_at(records, &updated_at).await?;
        Ok(updated_at)
    }

    /// Overwrite this device's snapshot stamped with `updated_at`
    ///
    /// Lets the caller remember the stamp before its own `last_sync` event
    /// can come back through the subscription.
    pub async fn push_snapshot_at(
        &self,
        records: &[CodeRecord],
        updated_at: &str,
    ) -> RemoteResult<()> {
        let snapshot = DeviceSnapshot {
            device_id: self.device.id.clone(),
            platform: self.device.platform.clone(),
            codes: records.to_vec(),
            updated_at: updated_at.to_string(),
        };

        let path = format!("{}{}", SNAPSHOTS_PREFIX, self.device.id);
        self.write(&path, serde_json::to_value(&snapshot)?).await?;
        self.write(LAST_SYNC_PATH, json!(updated_at)).await?;

        if let Err(e) = self.push_presence().await {
            warn!("Failed to refresh device presence: {}", e);
        }

        debug!("Pushed snapshot of {} code(s)", records.len());
        Ok(())
    }

    /// Record one redeemed code
    pub async fn push_usage_delta(&self, code: &str, used_at: &str) -> RemoteResult<()> {
        let entry = UsageEntry::used(used_at, Some(self.device.id.clone()));
        let path = format!("{}{}", USAGE_PREFIX, normalize_code(code));
        self.write(&path, serde_json::to_value(&entry)?).await
    }

    /// Record every used entry of a ledger
    pub async fn push_usage_ledger(&self, ledger: &UsageLedger) -> RemoteResult<()> {
        for (code, entry) in ledger.iter().filter(|(_, entry)| entry.used) {
            let path = format!("{}{}", USAGE_PREFIX, code);
            self.write(&path, serde_json::to_value(entry)?).await?;
        }
        Ok(())
    }

    /// Refresh this device's presence record
    pub async fn push_presence(&self) -> RemoteResult<()> {
        let presence = DevicePresence {
            device_id: self.device.id.clone(),
            platform: self.device.platform.clone(),
            last_seen: now_iso(),
        };
        let path = format!("{}{}", DEVICES_PREFIX, self.device.id);
        self.write(&path, serde_json::to_value(&presence)?).await
    }

    // ==================== Reads ====================

    /// Listen to snapshots, usage facts and `last_sync`
    ///
    /// Updates are forwarded to `handler` independently. This device's own
    /// snapshots are discarded.
    pub async fn subscribe(
        &self,
        handler: mpsc::UnboundedSender<RemoteUpdate>,
    ) -> RemoteResult<Subscription> {
        let mut subscription = Subscription { tasks: Vec::new() };

        let snapshots = self.transport.subscribe(SNAPSHOTS_PREFIX).await?;
        let device = self.device.clone();
        subscription.tasks.push(forward(snapshots, handler.clone(), move |event| {
            let snapshot = DeviceSnapshot::from_remote(&event.path, event.value).ok()?;
            if device.is_self(&snapshot.device_id) {
                debug!("Ignoring echo of own snapshot");
                return None;
            }
            Some(RemoteUpdate::Snapshot(snapshot))
        }));

        let usage = self.transport.subscribe(USAGE_PREFIX).await?;
        subscription.tasks.push(forward(usage, handler.clone(), |event| {
            let (code, entry) = parse_usage(&event.path, event.value)?;
            Some(RemoteUpdate::Usage(UsageLedger::from([(code, entry)])))
        }));

        let last_sync = self.transport.subscribe(LAST_SYNC_PATH).await?;
        subscription.tasks.push(forward(last_sync, handler, |event| {
            event.value.as_str().map(|s| RemoteUpdate::Timestamp(s.to_string()))
        }));

        Ok(subscription)
    }

    /// Read every snapshot and the usage map
    ///
    /// Failures are logged and read as "no remote data".
    pub async fn fetch_all(&self) -> Option<RemoteState> {
        match self.try_fetch_all().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to fetch remote state: {}", e);
                None
            }
        }
    }

    async fn try_fetch_all(&self) -> RemoteResult<RemoteState> {
        let snapshots = self
            .transport
            .list(SNAPSHOTS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(path, value)| match DeviceSnapshot::from_remote(&path, value) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Skipping unreadable snapshot at {}: {}", path, e);
                    None
                }
            })
            .filter(|snapshot| !self.device.is_self(&snapshot.device_id))
            .collect();

        let usage = self
            .transport
            .list(USAGE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(path, value)| parse_usage(&path, value))
            .collect();

        let last_sync = self
            .transport
            .get(LAST_SYNC_PATH)
            .await?
            .and_then(|value| value.as_str().map(str::to_string));

        Ok(RemoteState {
            snapshots,
            usage,
            last_sync,
        })
    }

    /// Every device that has announced itself
    pub async fn list_devices(&self) -> RemoteResult<Vec<DevicePresence>> {
        let mut devices: Vec<DevicePresence> = self
            .transport
            .list(DEVICES_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }
}

fn parse_usage(path: &str, value: Value) -> Option<(String, UsageEntry)> {
    let code = normalize_code(path.trim_start_matches(USAGE_PREFIX));
    if code.is_empty() {
        return None;
    }
    match serde_json::from_value::<UsageEntry>(value) {
        Ok(entry) => Some((code, entry.normalized())),
        Err(e) => {
            warn!("Ignoring invalid usage entry for {}: {}", code, e);
            None
        }
    }
}

/// Forward transport events to `handler` until either side closes
fn forward<F>(
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    handler: mpsc::UnboundedSender<RemoteUpdate>,
    mut map: F,
) -> JoinHandle<()>
where
    F: FnMut(RemoteEvent) -> Option<RemoteUpdate> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(update) = map(event) {
                if handler.send(update).is_err() {
                    break;
                }
            }
        }
    })
}
