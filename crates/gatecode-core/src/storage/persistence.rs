//! Local file persistence
//!
//! Handles saving and loading the device's code collection, the master
//! usage ledger and the sync timestamp. Uses atomic writes (write to temp
//! file, then rename) so readers never observe a partially written file.
//!
//! Storage location: `~/.local/share/gatecode/` (configurable via `Config`)
//!
//! Files:
//! - `codes.json` - The full code collection
//! - `master_usage.json` - Usage ledger keyed by normalized code
//! - `sync_timestamp` - Last local change marker (ISO-8601)

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{IoOp, StorageError, StorageResult};
use crate::config::Config;
use crate::models::{CodeRecord, RawCodeRecord, UsageLedger};

/// Sizes of the persisted files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub codes_exists: bool,
    pub codes_size: u64,
    pub ledger_exists: bool,
    pub ledger_size: u64,
}

impl StorageStats {
    /// Total bytes on disk
    pub fn total_size(&self) -> u64 {
        self.codes_size + self.ledger_size
    }
}

/// Persistence layer for the per-device state
pub struct FilePersistence {
    config: Config,
}

impl FilePersistence {
    /// Create a new persistence handler with the given configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load the raw code collection
    ///
    /// Returns `None` if nothing has been written yet and
    /// [`StorageError::Corrupt`] if the file can't be parsed.
    pub fn read_codes(&self) -> StorageResult<Option<Vec<RawCodeRecord>>> {
        read_json(&self.config.codes_path())
    }

    /// Replace the code collection
    pub fn write_codes(&self, records: &[CodeRecord]) -> StorageResult<()> {
        write_json(&self.config.codes_path(), records)
    }

    /// Load the master usage ledger
    pub fn read_usage_ledger(&self) -> StorageResult<Option<UsageLedger>> {
        read_json(&self.config.usage_ledger_path())
    }

    /// Replace the master usage ledger
    pub fn write_usage_ledger(&self, ledger: &UsageLedger) -> StorageResult<()> {
        write_json(&self.config.usage_ledger_path(), ledger)
    }

    /// Load the sync timestamp
    pub fn read_sync_timestamp(&self) -> StorageResult<Option<String>> {
        let path = self.config.sync_timestamp_path();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let trimmed = content.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(IoOp::Read, e, path)),
        }
    }

    /// Persist the sync timestamp
    pub fn write_sync_timestamp(&self, timestamp: &str) -> StorageResult<()> {
        atomic_write(&self.config.sync_timestamp_path(), timestamp.as_bytes())
    }

    /// Delete all stored data, including the usage ledger and timestamp
    pub fn delete_all(&self) -> StorageResult<()> {
        let paths = [
            self.config.codes_path(),
            self.config.usage_ledger_path(),
            self.config.sync_timestamp_path(),
        ];

        for path in paths {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StorageError::io(IoOp::Remove, e, &path))?;
            }
        }

        Ok(())
    }

    /// File sizes for status output
    pub fn stats(&self) -> StorageStats {
        let size = |path: PathBuf| fs::metadata(path).map(|m| m.len()).ok();
        let codes = size(self.config.codes_path());
        let ledger = size(self.config.usage_ledger_path());

        StorageStats {
            codes_exists: codes.is_some(),
            codes_size: codes.unwrap_or(0),
            ledger_exists: ledger.is_some(),
            ledger_size: ledger.unwrap_or(0),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(IoOp::Read, e, path)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Encode {
        path: path.to_path_buf(),
        details: e.to_string(),
    })?;
    atomic_write(path, &bytes)
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(IoOp::Write, e, parent))?;
    }

    // Temp file in the same directory so the rename stays atomic
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::io(IoOp::Write, e, &temp_path))?;

    file.write_all(data)
        .map_err(|e| StorageError::io(IoOp::Write, e, &temp_path))?;

    file.sync_all()
        .map_err(|e| StorageError::io(IoOp::Write, e, &temp_path))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::io(IoOp::Replace, e, path))?;

    Ok(())
}
