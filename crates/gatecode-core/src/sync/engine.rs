//! Sync orchestrator
//!
//! The [`SyncEngine`] owns everything one device needs: the local store,
//! the intra-device broadcast, the remote client and the background tasks.
//! It is the only component with timers.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized → Connecting → Synced
//!                            ↘ Degraded → (general re-check) → Synced
//! Uninitialized → LocalOnly            (no remote configured)
//! ```
//!
//! # Triggers
//!
//! Remote subscription events, the general re-check timer, the fast poll
//! timer and local publishes all funnel into idempotent routines: merging
//! identical state writes nothing, so no trigger can start a push loop.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{broadcast as tokio_broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::poller::spawn_poller;
use super::state::{EngineEvent, SyncState};
use crate::broadcast::{Broadcast, BroadcastAction};
use crate::config::Config;
use crate::device::Device;
use crate::error::CodeResult;
use crate::merge;
use crate::models::{now_iso, CodeRecord, UsageLedger};
use crate::remote::{
    DevicePresence, MemoryTransport, RemoteClient, RemoteError, RemoteResult, RemoteTransport,
    RemoteUpdate, Subscription, WsConfig, WsTransport,
};
use crate::storage::{FilePersistence, StorageStats, SyncClock};
use crate::store::{CodeStats, LocalStore};

/// Remote URL selecting the in-process store
pub const MEMORY_REMOTE: &str = "memory";

const EVENT_CAPACITY: usize = 32;

/// Snapshot of the engine for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: SyncState,
    pub device: Device,
    pub remote: Option<String>,
    pub sync_timestamp: Option<String>,
    pub codes: CodeStats,
    pub storage: StorageStats,
    pub devices: Vec<DevicePresence>,
}

/// Background machinery of a started engine
struct Running {
    shutdown_tx: watch::Sender<bool>,
    update_tx: mpsc::UnboundedSender<RemoteUpdate>,
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) device: Device,
    pub(crate) store: Mutex<LocalStore>,
    pub(crate) broadcast: Broadcast,
    pub(crate) remote: Option<RemoteClient>,
    state_tx: watch::Sender<SyncState>,
    events_tx: tokio_broadcast::Sender<EngineEvent>,
    /// Sync timestamp last reported to collaborators
    last_seen: StdMutex<Option<String>>,
    /// Remote `last_sync` last observed or pushed by us
    remote_last_sync: StdMutex<Option<String>>,
    running: Mutex<Option<Running>>,
}

/// Per-process synchronization engine
///
/// Cheap to clone; clones share the same store and background tasks.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open an engine for a configuration
    ///
    /// The remote is chosen from `remote_url`: `ws://`/`wss://` URLs use the
    /// WebSocket transport, `memory` an in-process store. Must be called
    /// from within a tokio runtime when a WebSocket remote is configured.
    pub fn open(config: Config) -> Result<Self> {
        let transport: Option<Arc<dyn RemoteTransport>> = match config.active_remote() {
            None => None,
            Some(MEMORY_REMOTE) => Some(Arc::new(MemoryTransport::new())),
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {
                Some(Arc::new(WsTransport::spawn(WsConfig::new(url))))
            }
            Some(url) => anyhow::bail!(
                "Unsupported remote URL: {} (expected ws://, wss:// or {})",
                url,
                MEMORY_REMOTE
            ),
        };
        Self::with_transport(config, Device::generate(), transport)
    }

    /// Open an engine on an explicit transport
    pub fn with_transport(
        config: Config,
        device: Device,
        transport: Option<Arc<dyn RemoteTransport>>,
    ) -> Result<Self> {
        let remote = transport.map(|t| RemoteClient::new(t, device.clone()));
        Self::with_client(config, device, remote)
    }

    /// Open an engine on an explicit remote client
    pub fn with_client(
        config: Config,
        device: Device,
        remote: Option<RemoteClient>,
    ) -> Result<Self> {
        config.ensure_data_dir()?;

        let persistence = Arc::new(FilePersistence::new(config.clone()));
        let broadcast = Broadcast::new(SyncClock::persisted(persistence.clone()));
        let store = LocalStore::new(persistence, broadcast.clone(), device.id.clone());
        let (state_tx, _) = watch::channel(SyncState::Uninitialized);
        let (events_tx, _) = tokio_broadcast::channel(EVENT_CAPACITY);

        debug!("Opened sync engine for device {}", device);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                device,
                store: Mutex::new(store),
                broadcast,
                remote,
                state_tx,
                events_tx,
                last_seen: StdMutex::new(None),
                remote_last_sync: StdMutex::new(None),
                running: Mutex::new(None),
            }),
        })
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// The intra-device broadcast channel
    pub fn broadcast(&self) -> &Broadcast {
        &self.inner.broadcast
    }

    /// Current sync state
    pub fn state(&self) -> SyncState {
        *self.inner.state_tx.borrow()
    }

    /// Watch sync state transitions
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    /// Listen for engine events
    pub fn subscribe_events(&self) -> tokio_broadcast::Receiver<EngineEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Whether background tasks are running
    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    fn set_state(&self, next: SyncState) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!("Sync state: {}", next);
            let _ = self.inner.events_tx.send(EngineEvent::StateChanged(next));
        }
    }

    // ==================== Lifecycle ====================

    /// Start syncing
    ///
    /// Subscribes to the remote replica and pushes a one-time catch-up of
    /// the local snapshot and usage ledger. A failing remote leaves the
    /// engine `Degraded`; the general re-check keeps trying to recover.
    /// Calling this on a started engine does nothing.
    pub async fn start(&self) -> SyncState {
        let mut guard = self.inner.running.lock().await;
        if guard.is_some() {
            debug!("Sync engine already started");
            return self.state();
        }

        let (shutdown_tx, _) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let mut running = Running {
            shutdown_tx,
            update_tx,
            subscription: None,
            tasks: Vec::new(),
        };

        // Changes made before start are not news
        let current = self.inner.store.lock().await.sync_timestamp();
        *self.inner.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = current;

        self.spawn_pollers(&mut running);

        match self.inner.remote.clone() {
            None => {
                info!("No remote configured; running local-only");
                self.set_state(SyncState::LocalOnly);
            }
            Some(remote) => {
                self.spawn_update_handler(&mut running, update_rx);
                self.spawn_push_worker(&mut running);

                self.set_state(SyncState::Connecting);
                match remote.subscribe(running.update_tx.clone()).await {
                    Ok(subscription) => {
                        running.subscription = Some(subscription);
                        self.pull_remote().await;
                        match self.catch_up().await {
                            Ok(()) => self.set_state(SyncState::Synced),
                            Err(e) => {
                                warn!("Initial catch-up push failed: {}", e);
                                self.set_state(SyncState::Degraded);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Remote subscription failed, continuing on local store: {}", e);
                        self.set_state(SyncState::Degraded);
                    }
                }
            }
        }

        *guard = Some(running);
        self.state()
    }

    /// Stop background tasks and the remote subscription
    ///
    /// Safe to call when not running.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().await.take();
        let Some(mut running) = running else {
            debug!("Sync engine not running");
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Some(mut subscription) = running.subscription.take() {
            subscription.unsubscribe();
        }
        for task in running.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        self.set_state(SyncState::Uninitialized);
        info!("Sync engine stopped");
    }

    fn spawn_pollers(&self, running: &mut Running) {
        let fast = self.weak();
        running.tasks.push(spawn_poller(
            "fast",
            self.inner.config.fast_poll_interval(),
            running.shutdown_tx.subscribe(),
            move || {
                let fast = fast.clone();
                async move {
                    match upgrade(&fast) {
                        Some(engine) => {
                            engine.check_for_updates().await;
                            true
                        }
                        None => false,
                    }
                }
            },
        ));

        let general = self.weak();
        running.tasks.push(spawn_poller(
            "general",
            self.inner.config.poll_interval(),
            running.shutdown_tx.subscribe(),
            move || {
                let general = general.clone();
                async move {
                    match upgrade(&general) {
                        Some(engine) => {
                            engine.general_tick().await;
                            true
                        }
                        None => false,
                    }
                }
            },
        ));
    }

    fn spawn_update_handler(
        &self,
        running: &mut Running,
        mut update_rx: mpsc::UnboundedReceiver<RemoteUpdate>,
    ) {
        let weak = self.weak();
        running.tasks.push(tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                let Some(engine) = upgrade(&weak) else {
                    break;
                };
                engine.apply_update(update).await;
            }
        }));
    }

    /// Drain the coalescing push trigger
    ///
    /// A mutation made while a push is in flight bumps the generation again
    /// and is picked up by the next iteration.
    fn spawn_push_worker(&self, running: &mut Running) {
        let weak = self.weak();
        let mut push_rx = self.inner.broadcast.push_requests();
        push_rx.borrow_and_update();
        let mut shutdown_rx = running.shutdown_tx.subscribe();

        running.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = push_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        push_rx.borrow_and_update();
                        let Some(engine) = upgrade(&weak) else {
                            break;
                        };
                        engine.push_now().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Push worker stopped");
        }));
    }

    fn weak(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    // ==================== Refresh ====================

    /// Compare the sync timestamp with the last observed value
    ///
    /// When it moved, re-read the local store and emit
    /// [`EngineEvent::CodesChanged`]. Returns whether anything changed.
    pub async fn check_for_updates(&self) -> bool {
        let timestamp = self.inner.store.lock().await.sync_timestamp();
        {
            let mut last_seen = self.inner.last_seen.lock().unwrap_or_else(|e| e.into_inner());
            if *last_seen == timestamp {
                return false;
            }
            *last_seen = timestamp.clone();
        }

        let count = self.inner.store.lock().await.read_all().len();
        debug!("Local codes changed ({} code(s))", count);
        let _ = self
            .inner
            .events_tx
            .send(EngineEvent::CodesChanged { timestamp, count });
        true
    }

    async fn general_tick(&self) {
        self.check_for_updates().await;
        if self.state() == SyncState::Degraded {
            self.recover().await;
        }
    }

    /// Try to leave degraded mode
    ///
    /// Re-establishes the subscription if needed, pulls what was missed and
    /// pushes a fresh catch-up. Stays degraded on any failure.
    pub async fn recover(&self) -> SyncState {
        let Some(remote) = self.inner.remote.clone() else {
            return self.state();
        };

        let subscribed = {
            let mut guard = self.inner.running.lock().await;
            let Some(running) = guard.as_mut() else {
                return self.state();
            };
            if running.subscription.as_ref().is_some_and(Subscription::is_active) {
                true
            } else {
                match remote.subscribe(running.update_tx.clone()).await {
                    Ok(subscription) => {
                        running.subscription = Some(subscription);
                        true
                    }
                    Err(e) => {
                        debug!("Remote still unavailable: {}", e);
                        false
                    }
                }
            }
        };

        if !subscribed || self.pull_remote().await.is_none() {
            return self.state();
        }

        match self.catch_up().await {
            Ok(()) => self.set_state(SyncState::Synced),
            Err(e) => debug!("Catch-up push still failing: {}", e),
        }
        self.state()
    }

    // ==================== Remote ====================

    /// Push the local snapshot and full usage ledger
    async fn catch_up(&self) -> RemoteResult<()> {
        let Some(remote) = &self.inner.remote else {
            return Ok(());
        };

        let (records, ledger) = {
            let store = self.inner.store.lock().await;
            (store.read_all(), store.usage_ledger())
        };

        self.push_snapshot(remote, &records).await?;
        remote.push_usage_ledger(&ledger).await?;

        info!(
            "Pushed {} code(s) and {} usage entry(s) to remote",
            records.len(),
            ledger.len()
        );
        Ok(())
    }

    /// Push everything now and wait for it
    ///
    /// Used before shutting down so no local change is left behind. A
    /// degraded engine goes through [`recover`](Self::recover), so it only
    /// reports `Synced` again with a live subscription.
    pub async fn flush(&self) -> CodeResult<()> {
        if self.inner.remote.is_none() {
            return Ok(());
        }
        if self.state() == SyncState::Degraded {
            return match self.recover().await {
                SyncState::Degraded => Err(RemoteError::Unavailable(
                    "remote still unreachable, changes kept locally".to_string(),
                )
                .into()),
                _ => Ok(()),
            };
        }
        self.catch_up().await?;
        Ok(())
    }

    /// Push the snapshot, remembering its stamp before the write
    ///
    /// Our own `last_sync` event may arrive before the write returns; it
    /// must not look like news.
    async fn push_snapshot(
        &self,
        remote: &RemoteClient,
        records: &[CodeRecord],
    ) -> RemoteResult<()> {
        let updated_at = now_iso();
        self.observe_remote_sync(&updated_at);
        remote.push_snapshot_at(records, &updated_at).await
    }

    /// Deferred push of the current snapshot
    async fn push_now(&self) {
        let Some(remote) = &self.inner.remote else {
            return;
        };
        let state = self.state();
        if !state.can_push() {
            debug!("Skipping push while {}", state);
            return;
        }

        let records = self.inner.store.lock().await.read_all();
        if let Err(e) = self.push_snapshot(remote, &records).await {
            warn!("Snapshot push failed, continuing on local store: {}", e);
            self.set_state(SyncState::Degraded);
        }
    }

    /// Record a remote `last_sync`; returns whether it is new
    fn observe_remote_sync(&self, timestamp: &str) -> bool {
        let mut last = self
            .inner
            .remote_last_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if last.as_deref() == Some(timestamp) {
            return false;
        }
        *last = Some(timestamp.to_string());
        true
    }

    /// Apply one update delivered by the remote subscription
    pub(crate) async fn apply_update(&self, update: RemoteUpdate) {
        let result = match update {
            RemoteUpdate::Snapshot(snapshot) => {
                debug!(
                    "Snapshot from {} with {} code(s)",
                    snapshot.device_id,
                    snapshot.codes.len()
                );
                self.merge_remote(&snapshot.codes, &UsageLedger::new()).await
            }
            RemoteUpdate::Usage(ledger) => self.merge_remote(&[], &ledger).await,
            RemoteUpdate::Timestamp(timestamp) => {
                if self.observe_remote_sync(&timestamp) {
                    debug!("Remote last_sync moved to {}", timestamp);
                    self.pull_remote().await;
                }
                return;
            }
        };

        if let Err(e) = result {
            warn!("Failed to merge remote update: {}", e);
        }
    }

    /// Read the whole remote state and merge it
    ///
    /// Returns `None` when the remote could not be read, otherwise whether
    /// the local store changed.
    pub async fn pull_remote(&self) -> Option<bool> {
        let remote = self.inner.remote.as_ref()?;
        let state = remote.fetch_all().await?;

        if let Some(last_sync) = &state.last_sync {
            self.observe_remote_sync(last_sync);
        }

        match self.merge_remote(&state.all_codes(), &state.usage).await {
            Ok(changed) => Some(changed),
            Err(e) => {
                warn!("Failed to merge remote state: {}", e);
                Some(false)
            }
        }
    }

    /// Merge remote records and usage into the local store
    ///
    /// Writes (and therefore broadcasts and re-pushes) only when the merge
    /// changes something.
    pub(crate) async fn merge_remote(
        &self,
        codes: &[CodeRecord],
        usage: &UsageLedger,
    ) -> CodeResult<bool> {
        let mut store = self.inner.store.lock().await;

        let local_ledger = store.usage_ledger();
        let ledger = merge::merge_usage(&local_ledger, usage);
        if ledger != local_ledger {
            store.write_usage_ledger(&ledger)?;
        }

        let local = store.read_all();
        let merged = merge::apply_usage(&merge::merge(&local, codes), &ledger);
        if merged == local {
            debug!("Remote state already merged");
            return Ok(false);
        }

        let added = merged.len() - local.len();
        store.write_all_as(merged, BroadcastAction::RemoteMerged)?;
        info!("Merged remote changes ({} new code(s))", added);
        Ok(true)
    }

    // ==================== Status ====================

    /// Everything worth reporting about this engine
    pub async fn status(&self) -> EngineStatus {
        let (sync_timestamp, codes, storage) = {
            let store = self.inner.store.lock().await;
            (store.sync_timestamp(), store.stats(), store.storage_stats())
        };

        let devices = match &self.inner.remote {
            Some(remote) if self.state() != SyncState::Degraded => {
                remote.list_devices().await.unwrap_or_else(|e| {
                    debug!("Could not list devices: {}", e);
                    Vec::new()
                })
            }
            _ => Vec::new(),
        };

        EngineStatus {
            state: self.state(),
            device: self.inner.device.clone(),
            remote: self.inner.config.active_remote().map(str::to_string),
            sync_timestamp,
            codes,
            storage,
            devices,
        }
    }
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<SyncEngine> {
    weak.upgrade().map(|inner| SyncEngine { inner })
}
