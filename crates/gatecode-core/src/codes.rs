//! Code operations
//!
//! The surface collaborators (admin tooling, redemption front-ends, the
//! CLI) use. Every mutation goes through the local store, which broadcasts
//! the change and schedules the remote push.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastAction;
use crate::error::{CodeError, CodeResult};
use crate::merge;
use crate::models::{
    generate_code_string, normalize, normalize_code, now_iso, validate_custom_code,
    CodeRecord, RawCodeRecord,
};
use crate::store::CodeStats;
use crate::sync::SyncEngine;

/// Format version written into export bundles
pub const EXPORT_VERSION: u32 = 1;

/// Attempts at finding an unused random code
const GENERATE_ATTEMPTS: usize = 16;

/// Result of a redemption attempt, ready to show to an end user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub success: bool,
    pub message: String,
}

/// Result of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub new_codes_added: usize,
    pub total_imported: usize,
}

/// Out-of-band sharing format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u32,
    pub exported_at: String,
    pub codes: Vec<RawCodeRecord>,
}

/// Encode the unused records of `records` as an opaque string
pub fn export_codes(records: &[CodeRecord]) -> CodeResult<String> {
    let bundle = ExportBundle {
        version: EXPORT_VERSION,
        exported_at: now_iso(),
        codes: records
            .iter()
            .filter(|r| !r.used)
            .cloned()
            .map(RawCodeRecord::from)
            .collect(),
    };
    let json = serde_json::to_vec(&bundle)
        .map_err(|e| CodeError::Validation(format!("could not encode export: {}", e)))?;
    Ok(BASE64.encode(json))
}

/// Decode an export string into normalized records
///
/// Used records are skipped; exports only carry codes that can still be
/// redeemed.
pub fn decode_export(blob: &str) -> CodeResult<Vec<CodeRecord>> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|e| CodeError::Validation(format!("export is not valid base64: {}", e)))?;
    let bundle: ExportBundle = serde_json::from_slice(&bytes)
        .map_err(|e| CodeError::Validation(format!("export is not a code bundle: {}", e)))?;

    if bundle.version > EXPORT_VERSION {
        warn!(
            "Export version {} is newer than supported version {}",
            bundle.version, EXPORT_VERSION
        );
    }

    Ok(bundle
        .codes
        .into_iter()
        .filter_map(|raw| normalize(raw).ok())
        .filter(|r| !r.used)
        .collect())
}

impl SyncEngine {
    /// Create and persist a new unused record with a random code
    pub async fn generate_code(&self) -> CodeResult<CodeRecord> {
        let mut store = self.inner.store.lock().await;
        let ledger = store.usage_ledger();

        for _ in 0..GENERATE_ATTEMPTS {
            let code = generate_code_string();
            // A code redeemed before must never come back as new
            if ledger.contains_key(&code) {
                continue;
            }
            match store.upsert(CodeRecord::new(&code), true) {
                Ok(record) => {
                    info!("Generated code {}", record.code);
                    return Ok(record);
                }
                Err(CodeError::Duplicate(_)) => debug!("Generated code {} collides", code),
                Err(e) => return Err(e),
            }
        }

        Err(CodeError::Validation(
            "could not find an unused code, try again".to_string(),
        ))
    }

    /// Create a record with an operator-chosen code
    pub async fn create_code(&self, code: &str) -> CodeResult<CodeRecord> {
        let code = validate_custom_code(code)?;
        let mut store = self.inner.store.lock().await;

        if store.is_used_in_ledger(&code).is_some() {
            return Err(CodeError::Duplicate(code));
        }
        let record = store.upsert(CodeRecord::new(&code), true)?;
        info!("Created code {}", record.code);
        Ok(record)
    }

    /// Redeem a code
    ///
    /// Fails with [`CodeError::NotFound`] when no record matches and with
    /// [`CodeError::AlreadyUsed`] when it was redeemed before, here or on
    /// any replica whose usage reached this device.
    pub async fn redeem_code(&self, code: &str) -> CodeResult<CodeRecord> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(CodeError::Validation("code must not be empty".to_string()));
        }

        let record = {
            let mut store = self.inner.store.lock().await;

            if let Some(entry) = store.is_used_in_ledger(&code) {
                return Err(CodeError::AlreadyUsed {
                    code,
                    used_at: entry.used_at,
                });
            }

            match store.find(&code) {
                None => return Err(CodeError::NotFound { code }),
                Some(record) if record.used => {
                    return Err(CodeError::AlreadyUsed {
                        code,
                        used_at: record.used_at,
                    })
                }
                Some(_) => {}
            }

            store.mark_used(&code)?;
            store.find(&code).ok_or(CodeError::NotFound { code })?
        };

        info!("Code {} redeemed", record.code);

        if let Some(remote) = self.inner.remote.clone() {
            let code = record.code.clone();
            let used_at = record.used_at.clone().unwrap_or_else(now_iso);
            tokio::spawn(async move {
                if let Err(e) = remote.push_usage_delta(&code, &used_at).await {
                    warn!("Failed to push usage of {}: {}", code, e);
                }
            });
        }

        Ok(record)
    }

    /// Redeem a code, reporting the outcome as an end-user message
    pub async fn verify_code(&self, code: &str) -> VerifyOutcome {
        match self.redeem_code(code).await {
            Ok(_) => VerifyOutcome {
                success: true,
                message: "Code verified. Access granted.".to_string(),
            },
            Err(e) if e.is_user_facing() => VerifyOutcome {
                success: false,
                message: e.to_string(),
            },
            Err(e) => {
                error!("Verification failed: {}", e);
                VerifyOutcome {
                    success: false,
                    message: "Verification failed. Please try again.".to_string(),
                }
            }
        }
    }

    /// Current converged code set
    pub async fn list_codes(&self) -> Vec<CodeRecord> {
        self.inner.store.lock().await.read_all()
    }

    /// Counts over the current code set
    pub async fn stats(&self) -> CodeStats {
        self.inner.store.lock().await.stats()
    }

    /// Remove the record with this id
    ///
    /// Propagates as a full-snapshot overwrite; replicas that still hold
    /// the code will hand it back on their next merge.
    pub async fn delete_code(&self, id: u64) -> CodeResult<CodeRecord> {
        let mut store = self.inner.store.lock().await;
        let mut records = store.read_all();

        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return Err(CodeError::NotFound {
                code: id.to_string(),
            });
        };
        let removed = records.remove(pos);

        store.write_all_as(records, BroadcastAction::CodeDeleted)?;
        info!("Deleted code {}", removed.code);
        Ok(removed)
    }

    /// Remove every record; returns how many were removed
    pub async fn delete_all(&self) -> CodeResult<usize> {
        let mut store = self.inner.store.lock().await;
        let count = store.read_all().len();
        store.clear_codes()?;
        info!("Deleted all {} code(s)", count);
        Ok(count)
    }

    /// Export every unused code
    pub async fn export_unused(&self) -> CodeResult<String> {
        export_codes(&self.list_codes().await)
    }

    /// Import codes from an export string
    ///
    /// Codes already present are skipped, and so are codes the usage ledger
    /// knows as redeemed. Imported ids that collide with existing ones are
    /// reassigned by the store.
    pub async fn import_codes(&self, blob: &str) -> CodeResult<ImportSummary> {
        let imported = decode_export(blob)?;
        let total_imported = imported.len();

        let mut store = self.inner.store.lock().await;
        let local = store.read_all();
        let ledger = store.usage_ledger();
        let mut codes: HashSet<String> = local.iter().map(|r| r.code.clone()).collect();

        let mut added = Vec::new();
        for record in imported {
            if ledger.get(&record.code).is_some_and(|entry| entry.used) {
                debug!("Not importing redeemed code {}", record.code);
                continue;
            }
            if codes.insert(record.code.clone()) {
                added.push(record);
            }
        }

        let new_codes_added = added.len();
        if new_codes_added > 0 {
            store.write_all_as(merge::merge(&local, &added), BroadcastAction::CodesImported)?;
        }

        info!(
            "Imported {} new code(s) out of {}",
            new_codes_added, total_imported
        );
        Ok(ImportSummary {
            new_codes_added,
            total_imported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::Device;
    use tempfile::TempDir;

    fn local_engine(temp_dir: &TempDir) -> SyncEngine {
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        SyncEngine::with_transport(config, Device::generate(), None).unwrap()
    }

    #[tokio::test]
    async fn test_generate_code() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);

        let record = engine.generate_code().await.unwrap();
        assert_eq!(record.code.len(), 5);
        assert!(record
            .code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(!record.used);
        assert_eq!(engine.list_codes().await, vec![record]);
    }

    #[tokio::test]
    async fn test_create_code_rejects_duplicates_and_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);

        engine.create_code("vip2024").await.unwrap();
        assert!(matches!(
            engine.create_code(" VIP2024 ").await,
            Err(CodeError::Duplicate(_))
        ));
        assert!(matches!(
            engine.create_code("no spaces").await,
            Err(CodeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_then_verify_again() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        engine.create_code("DEMO1").await.unwrap();

        let first = engine.verify_code("demo1").await;
        assert!(first.success);

        let record = &engine.list_codes().await[0];
        assert!(record.used);
        assert!(record.used_at.is_some());

        let second = engine.verify_code("DEMO1").await;
        assert!(!second.success);
        assert_eq!(second.message, "This code has already been used.");
        assert!(matches!(
            engine.redeem_code("DEMO1").await,
            Err(CodeError::AlreadyUsed { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_unknown_code() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        engine.create_code("DEMO1").await.unwrap();

        let outcome = engine.verify_code("ZZZZZ").await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Invalid code. Please check and try again.");
        assert!(matches!(
            engine.redeem_code("ZZZZZ").await,
            Err(CodeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_ledger_blocks_redeemed_codes_after_clear() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        engine.create_code("DEMO1").await.unwrap();
        assert!(engine.verify_code("DEMO1").await.success);

        assert_eq!(engine.delete_all().await.unwrap(), 1);
        assert!(matches!(
            engine.redeem_code("DEMO1").await,
            Err(CodeError::AlreadyUsed { .. })
        ));
        assert!(matches!(
            engine.create_code("DEMO1").await,
            Err(CodeError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_code() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        let keep = engine.create_code("KEEP1").await.unwrap();
        let gone = engine.create_code("DROP1").await.unwrap();

        let removed = engine.delete_code(gone.id).await.unwrap();
        assert_eq!(removed.code, "DROP1");
        assert_eq!(engine.list_codes().await, vec![keep]);

        assert!(matches!(
            engine.delete_code(gone.id).await,
            Err(CodeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_export_import_on_fresh_store() {
        let source_dir = TempDir::new().unwrap();
        let source = local_engine(&source_dir);
        for code in ["AAAA1", "BBBB2", "CCCC3"] {
            source.create_code(code).await.unwrap();
        }
        source.verify_code("CCCC3").await;

        let blob = source.export_unused().await.unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = local_engine(&target_dir);
        let summary = target.import_codes(&blob).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                new_codes_added: 2,
                total_imported: 2
            }
        );

        let mut codes: Vec<_> = target.list_codes().await.into_iter().map(|r| r.code).collect();
        codes.sort();
        assert_eq!(codes, vec!["AAAA1", "BBBB2"]);

        // Importing again adds nothing
        let again = target.import_codes(&blob).await.unwrap();
        assert_eq!(again.new_codes_added, 0);
        assert_eq!(again.total_imported, 2);
    }

    #[tokio::test]
    async fn test_import_reassigns_colliding_ids() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        let existing = engine.create_code("LOCAL").await.unwrap();

        let mut foreign = CodeRecord::new("REMOTE");
        foreign.id = existing.id;
        let blob = export_codes(&[foreign]).unwrap();

        engine.import_codes(&blob).await.unwrap();
        let codes = engine.list_codes().await;
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].id, existing.id);
        assert_ne!(codes[0].id, codes[1].id);
    }

    #[tokio::test]
    async fn test_import_skips_redeemed_codes() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        engine.create_code("GIFT1").await.unwrap();
        let blob = engine.export_unused().await.unwrap();

        assert!(engine.verify_code("GIFT1").await.success);
        engine.delete_all().await.unwrap();

        let summary = engine.import_codes(&blob).await.unwrap();
        assert_eq!(summary.new_codes_added, 0);
        assert_eq!(summary.total_imported, 1);
        assert!(engine.list_codes().await.is_empty());
        assert_eq!(engine.stats().await.unused, 0);
        assert!(decode_export(&engine.export_unused().await.unwrap())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);

        assert!(matches!(
            engine.import_codes("not base64 at all!").await,
            Err(CodeError::Validation(_))
        ));
        assert!(matches!(
            engine.import_codes(&BASE64.encode(b"{\"nope\": 1}")).await,
            Err(CodeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let engine = local_engine(&temp_dir);
        engine.create_code("A1").await.unwrap();
        engine.create_code("B2").await.unwrap();
        engine.verify_code("A1").await;

        let stats = engine.stats().await;
        assert_eq!((stats.total, stats.used, stats.unused), (2, 1, 1));
    }
}
