//! Local store
//!
//! The `LocalStore` is the device-resident copy of the code set. It
//! coordinates between:
//! - File persistence (codes, master usage ledger, sync timestamp)
//! - The intra-device broadcast (change notifications + deferred push)
//!
//! Every read normalizes; every write normalizes, deduplicates by code and
//! replaces the whole collection atomically. Callers re-read before they
//! write, so a write always carries the freshest full set.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = LocalStore::open(config, broadcast, device_id);
//!
//! store.upsert(CodeRecord::new("demo1"), true)?;
//! assert!(store.mark_used("DEMO1")?);
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::broadcast::{Broadcast, BroadcastAction};
use crate::config::Config;
use crate::error::{CodeError, CodeResult};
use crate::merge;
use crate::models::{
    normalize, normalize_code, normalize_record, now_iso, random_id, CodeRecord, UsageEntry,
    UsageLedger,
};
use crate::storage::{FilePersistence, StorageError, StorageStats};

/// Counts over the current code set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodeStats {
    pub total: usize,
    pub used: usize,
    pub unused: usize,
}

impl CodeStats {
    /// Count a record set
    pub fn from_records(records: &[CodeRecord]) -> Self {
        let used = records.iter().filter(|r| r.used).count();
        Self {
            total: records.len(),
            used,
            unused: records.len() - used,
        }
    }
}

/// Durable per-device code storage
pub struct LocalStore {
    persistence: Arc<FilePersistence>,
    broadcast: Broadcast,
    device_id: String,
}

impl LocalStore {
    /// Open the store on top of existing persistence and broadcast channel
    pub fn new(
        persistence: Arc<FilePersistence>,
        broadcast: Broadcast,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            broadcast,
            device_id: device_id.into(),
        }
    }

    /// Open the store for a configuration
    pub fn open(config: Config, broadcast: Broadcast, device_id: impl Into<String>) -> Self {
        Self::new(Arc::new(FilePersistence::new(config)), broadcast, device_id)
    }

    /// The configuration backing this store
    pub fn config(&self) -> &Config {
        self.persistence.config()
    }

    /// The broadcast channel this store publishes on
    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }

    // ==================== Records ====================

    /// Read the normalized code set
    ///
    /// Missing or unparseable data reads as an empty set.
    pub fn read_all(&self) -> Vec<CodeRecord> {
        let raw = match self.persistence.read_codes() {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e @ StorageError::Corrupt { .. }) => {
                warn!(
                    "{}; treating local store as empty",
                    CodeError::StorageCorrupt(e.to_string())
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to read local codes, treating as empty: {}", e);
                return Vec::new();
            }
        };

        let records: Vec<CodeRecord> = raw
            .into_iter()
            .filter_map(|r| match normalize(r) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Dropping unreadable stored record: {}", e);
                    None
                }
            })
            .collect();

        merge::dedup(&records)
    }

    /// Replace the whole code set
    ///
    /// Normalizes and deduplicates, persists atomically, then publishes
    /// `CODES_UPDATED` with the resulting count (which also advances the
    /// sync timestamp and requests a remote push).
    pub fn write_all(&mut self, records: Vec<CodeRecord>) -> CodeResult<Vec<CodeRecord>> {
        self.write_all_as(records, BroadcastAction::CodesUpdated)
    }

    /// Replace the whole code set, announcing it as `action`
    pub fn write_all_as(
        &mut self,
        records: Vec<CodeRecord>,
        action: BroadcastAction,
    ) -> CodeResult<Vec<CodeRecord>> {
        let normalized: Vec<CodeRecord> = records
            .into_iter()
            .filter_map(|r| normalize_record(r).ok())
            .collect();
        let mut normalized = merge::dedup(&normalized);
        assign_unique_ids(&mut normalized);

        self.persistence.write_codes(&normalized)?;
        debug!("Wrote {} code(s) to local store", normalized.len());

        self.broadcast
            .publish(action, json!({ "count": normalized.len() }));

        Ok(normalized)
    }

    /// Insert a record
    ///
    /// With `strict`, an existing record with the same code is a
    /// [`CodeError::Duplicate`]. Otherwise the record is merged into the
    /// existing one (usage OR-ed, identity fields kept).
    pub fn upsert(&mut self, record: CodeRecord, strict: bool) -> CodeResult<CodeRecord> {
        let record = normalize_record(record)?;
        let records = self.read_all();

        if strict && records.iter().any(|r| r.code == record.code) {
            return Err(CodeError::Duplicate(record.code));
        }

        let code = record.code.clone();
        let written = self.write_all(merge::merge(&records, &[record]))?;

        written
            .into_iter()
            .find(|r| r.code == code)
            .ok_or(CodeError::NotFound { code })
    }

    /// Look up a record by code (case-insensitive)
    pub fn find(&self, code: &str) -> Option<CodeRecord> {
        let code = normalize_code(code);
        self.read_all().into_iter().find(|r| r.code == code)
    }

    /// Mark a code used
    ///
    /// Returns `false` when no record has this code. The usage is also
    /// recorded in the master usage ledger.
    pub fn mark_used(&mut self, code: &str) -> CodeResult<bool> {
        let code = normalize_code(code);
        let mut records = self.read_all();

        let Some(record) = records.iter_mut().find(|r| r.code == code) else {
            return Ok(false);
        };
        record.mark_used(now_iso());
        let used_at = record.used_at.clone();

        self.write_all_as(records, BroadcastAction::CodeVerified)?;

        let mut ledger = self.usage_ledger();
        let entry = UsageEntry {
            used: true,
            used_at,
            device_id: Some(self.device_id.clone()),
        };
        ledger = merge::merge_usage(&ledger, &UsageLedger::from([(code, entry)]));
        self.write_usage_ledger(&ledger)?;

        Ok(true)
    }

    /// Remove every record (the usage ledger is kept)
    pub fn clear_codes(&mut self) -> CodeResult<()> {
        self.write_all_as(Vec::new(), BroadcastAction::CodesCleared)?;
        Ok(())
    }

    // ==================== Usage ledger ====================

    /// Read the master usage ledger
    pub fn usage_ledger(&self) -> UsageLedger {
        match self.persistence.read_usage_ledger() {
            Ok(Some(ledger)) => ledger
                .into_iter()
                .map(|(code, entry)| (normalize_code(&code), entry.normalized()))
                .filter(|(code, _)| !code.is_empty())
                .collect(),
            Ok(None) => UsageLedger::new(),
            Err(e) => {
                warn!("Failed to read usage ledger, treating as empty: {}", e);
                UsageLedger::new()
            }
        }
    }

    /// Replace the master usage ledger
    pub fn write_usage_ledger(&mut self, ledger: &UsageLedger) -> CodeResult<()> {
        self.persistence.write_usage_ledger(ledger)?;
        Ok(())
    }

    /// Whether the ledger records this code as used
    pub fn is_used_in_ledger(&self, code: &str) -> Option<UsageEntry> {
        self.usage_ledger()
            .remove(&normalize_code(code))
            .filter(|entry| entry.used)
    }

    // ==================== Maintenance ====================

    /// Current sync timestamp
    pub fn sync_timestamp(&self) -> Option<String> {
        self.broadcast.clock().current()
    }

    /// Remove all local state, including the ledger and sync timestamp
    pub fn wipe(&mut self) -> CodeResult<()> {
        self.persistence.delete_all()?;
        self.broadcast.clock().reset();
        Ok(())
    }

    /// Counts over the current code set
    pub fn stats(&self) -> CodeStats {
        CodeStats::from_records(&self.read_all())
    }

    /// File sizes on disk
    pub fn storage_stats(&self) -> StorageStats {
        self.persistence.stats()
    }
}

/// Give every record after the first holder of an id a fresh one
///
/// Ids are only local keys; records learned from other devices or imports
/// may arrive with ids already taken here.
fn assign_unique_ids(records: &mut [CodeRecord]) {
    let mut seen: HashSet<u64> = HashSet::with_capacity(records.len());
    for record in records.iter_mut() {
        while !seen.insert(record.id) {
            debug!("Reassigning colliding id {} of {}", record.id, record.code);
            record.id = random_id();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SyncClock;
    use tempfile::TempDir;

    fn test_store(temp_dir: &TempDir) -> LocalStore {
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        let persistence = Arc::new(FilePersistence::new(config));
        let broadcast = Broadcast::new(SyncClock::persisted(persistence.clone()));
        LocalStore::new(persistence, broadcast, "gate-test")
    }

    #[test]
    fn test_write_keeps_ids_unique() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);

        let mut first = CodeRecord::new("FIRST");
        first.id = 7;
        let mut second = CodeRecord::new("SECND");
        second.id = 7;

        let written = store.write_all(vec![first, second]).unwrap();
        assert_eq!(written[0].id, 7);
        assert_ne!(written[1].id, 7);
        assert_eq!(store.read_all(), written);
    }

    #[test]
    fn test_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        assert!(store.read_all().is_empty());
        assert!(store.usage_ledger().is_empty());
        assert!(store.sync_timestamp().is_none());
    }

    #[test]
    fn test_corrupt_store_reads_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        std::fs::write(store.config().codes_path(), b"[{\"code\": 12").unwrap();
        std::fs::write(store.config().usage_ledger_path(), b"nope").unwrap();

        assert!(store.read_all().is_empty());
        assert!(store.usage_ledger().is_empty());
    }

    #[test]
    fn test_read_normalizes_and_drops_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        std::fs::write(
            store.config().codes_path(),
            br#"[{"code":" abcde "},{"code":"   "},{"id":7,"code":"ABCDE","used":true}]"#,
        )
        .unwrap();

        let records = store.read_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, "ABCDE");
        assert!(records[0].used);
    }

    #[tokio::test]
    async fn test_write_all_publishes_and_advances_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        let mut rx = store.broadcast().subscribe();

        let written = store
            .write_all(vec![CodeRecord::new("aaaaa"), CodeRecord::new("AAAAA")])
            .unwrap();
        assert_eq!(written.len(), 1);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.action, BroadcastAction::CodesUpdated);
        assert_eq!(message.data["count"], 1);
        assert_eq!(store.sync_timestamp(), Some(message.timestamp));
        assert_eq!(store.read_all(), written);
    }

    #[test]
    fn test_upsert_strict_rejects_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);

        store.upsert(CodeRecord::new("vip"), true).unwrap();
        let err = store.upsert(CodeRecord::new(" VIP "), true).unwrap_err();
        assert!(matches!(err, CodeError::Duplicate(code) if code == "VIP"));
        assert_eq!(store.read_all().len(), 1);
    }

    #[test]
    fn test_upsert_non_strict_merges() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);

        let original = store.upsert(CodeRecord::new("VIP"), true).unwrap();
        let mut used = CodeRecord::new("vip");
        used.mark_used("2024-01-01T00:00:00Z");

        let merged = store.upsert(used, false).unwrap();
        assert_eq!(merged.id, original.id);
        assert!(merged.used);
        assert_eq!(store.read_all().len(), 1);
    }

    #[test]
    fn test_mark_used() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        store.upsert(CodeRecord::new("DEMO1"), true).unwrap();

        assert!(!store.mark_used("NOPE1").unwrap());
        assert!(store.mark_used("demo1").unwrap());

        let record = store.find("DEMO1").unwrap();
        assert!(record.used);
        assert!(record.used_at.is_some());

        let entry = store.is_used_in_ledger("Demo1").unwrap();
        assert_eq!(entry.used_at, record.used_at);
        assert_eq!(entry.device_id.as_deref(), Some("gate-test"));
    }

    #[tokio::test]
    async fn test_actions_name_the_change() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        store.upsert(CodeRecord::new("DEMO1"), true).unwrap();
        let mut rx = store.broadcast().subscribe();

        store.mark_used("DEMO1").unwrap();
        store.clear_codes().unwrap();

        assert_eq!(rx.recv().await.unwrap().action, BroadcastAction::CodeVerified);
        assert_eq!(rx.recv().await.unwrap().action, BroadcastAction::CodesCleared);
    }

    #[test]
    fn test_ledger_survives_clear() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        store.upsert(CodeRecord::new("DEMO1"), true).unwrap();
        store.mark_used("DEMO1").unwrap();

        store.clear_codes().unwrap();
        assert!(store.read_all().is_empty());
        assert!(store.is_used_in_ledger("DEMO1").is_some());
    }

    #[test]
    fn test_wipe_removes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        store.upsert(CodeRecord::new("DEMO1"), true).unwrap();
        store.mark_used("DEMO1").unwrap();

        store.wipe().unwrap();
        assert!(store.read_all().is_empty());
        assert!(store.usage_ledger().is_empty());
        assert!(store.sync_timestamp().is_none());
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = test_store(&temp_dir);
        store.upsert(CodeRecord::new("A1"), true).unwrap();
        store.upsert(CodeRecord::new("B2"), true).unwrap();
        store.mark_used("A1").unwrap();

        assert_eq!(
            store.stats(),
            CodeStats {
                total: 2,
                used: 1,
                unused: 1
            }
        );
        assert!(store.storage_stats().codes_exists);
    }
}
