//! Merge engine
//!
//! Deterministic reconciliation of code sets and usage ledgers coming from
//! different replicas.
//!
//! # Rules
//!
//! 1. The code string is identity; ids are never compared.
//! 2. Codes only known remotely are appended after the local ones.
//! 3. `used` is the logical OR of both sides and never reverts.
//! 4. `usedAt` comes from the remote side only when the local one is unset.
//! 5. `id` and `generatedAt` are never overwritten once known locally.
//!
//! These rules make merging commutative on the set of codes and their usage
//! flags, and idempotent: merging a set with itself changes nothing, which
//! is what lets callers skip a re-push when a merge is a no-op.

use std::collections::HashMap;

use crate::models::{CodeRecord, UsageEntry, UsageLedger};

/// Merge `remote` into `local`
pub fn merge(local: &[CodeRecord], remote: &[CodeRecord]) -> Vec<CodeRecord> {
    let mut merged: Vec<CodeRecord> = Vec::with_capacity(local.len() + remote.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(local.len() + remote.len());

    for record in local.iter().chain(remote) {
        match index.get(&record.code) {
            Some(&pos) => absorb(&mut merged[pos], record),
            None => {
                index.insert(record.code.clone(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    merged
}

/// Collapse records sharing a code into one, keeping the first occurrence
pub fn dedup(records: &[CodeRecord]) -> Vec<CodeRecord> {
    merge(&[], records)
}

/// Merge two usage ledgers field by field
pub fn merge_usage(local: &UsageLedger, remote: &UsageLedger) -> UsageLedger {
    let mut merged = local.clone();

    for (code, incoming) in remote {
        match merged.get_mut(code) {
            Some(existing) => {
                if incoming.used && !existing.used {
                    existing.used = true;
                }
                if existing.used && existing.used_at.is_none() {
                    existing.used_at = incoming.used_at.clone();
                }
                if existing.device_id.is_none() {
                    existing.device_id = incoming.device_id.clone();
                }
            }
            None => {
                merged.insert(code.clone(), incoming.clone());
            }
        }
    }

    merged
}

/// Reflect ledger usage into the full record set
///
/// Only codes already present are touched; a usage fact alone does not
/// create a record.
pub fn apply_usage(records: &[CodeRecord], ledger: &UsageLedger) -> Vec<CodeRecord> {
    records
        .iter()
        .map(|record| match ledger.get(&record.code) {
            Some(UsageEntry {
                used: true,
                used_at,
                ..
            }) if !record.used || record.used_at.is_none() => {
                let mut record = record.clone();
                record.used = true;
                if record.used_at.is_none() {
                    record.used_at = used_at.clone();
                }
                record
            }
            _ => record.clone(),
        })
        .collect()
}

/// Ledger entries for every used record
pub fn usage_from_records(records: &[CodeRecord]) -> UsageLedger {
    records
        .iter()
        .filter(|r| r.used)
        .map(|r| {
            (
                r.code.clone(),
                UsageEntry {
                    used: true,
                    used_at: r.used_at.clone(),
                    device_id: None,
                },
            )
        })
        .collect()
}

fn absorb(target: &mut CodeRecord, other: &CodeRecord) {
    if other.used && !target.used {
        target.used = true;
    }
    if target.used && target.used_at.is_none() {
        target.used_at = other.used_at.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn record(id: u64, code: &str, used: bool) -> CodeRecord {
        CodeRecord {
            id,
            code: code.to_string(),
            used,
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            used_at: used.then(|| format!("2024-02-0{}T00:00:00Z", id % 9 + 1)),
        }
    }

    fn sample_sets() -> Vec<Vec<CodeRecord>> {
        vec![
            vec![],
            vec![record(1, "AAAAA", false)],
            vec![record(2, "AAAAA", true), record(3, "BBBBB", false)],
            vec![record(4, "BBBBB", true), record(5, "CCCCC", false)],
            vec![
                record(6, "CCCCC", true),
                record(7, "DDDDD", false),
                record(8, "AAAAA", false),
            ],
        ]
    }

    fn usage_by_code(records: &[CodeRecord]) -> Vec<(String, bool)> {
        let mut pairs: Vec<_> = records.iter().map(|r| (r.code.clone(), r.used)).collect();
        pairs.sort();
        pairs
    }

    #[test]
    fn test_merge_is_idempotent() {
        for set in sample_sets() {
            assert_eq!(merge(&set, &set), set);
        }
    }

    #[test]
    fn test_merge_converges_regardless_of_order() {
        let sets = sample_sets();
        for a in &sets {
            for b in &sets {
                let ab = merge(a, b);
                let ba = merge(b, a);

                let codes_ab: BTreeSet<_> = ab.iter().map(|r| r.code.clone()).collect();
                let codes_ba: BTreeSet<_> = ba.iter().map(|r| r.code.clone()).collect();
                assert_eq!(codes_ab, codes_ba);
                assert_eq!(usage_by_code(&ab), usage_by_code(&ba));
            }
        }
    }

    #[test]
    fn test_merge_usage_is_monotonic() {
        let sets = sample_sets();
        for a in &sets {
            let merged = merge(a, &sets[2]);
            let aaaaa = merged.iter().find(|r| r.code == "AAAAA").unwrap();
            assert!(aaaaa.used);

            // Nothing merged afterwards can clear it
            for b in &sets {
                let again = merge(&merged, b);
                assert!(again.iter().find(|r| r.code == "AAAAA").unwrap().used);
            }
        }
    }

    #[test]
    fn test_merge_dedups_by_code() {
        let local = vec![record(1, "DUPE1", false), record(2, "DUPE1", true)];
        let merged = merge(&local, &[record(3, "DUPE1", false)]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, 1);
        assert!(merged[0].used);
    }

    #[test]
    fn test_merge_into_empty_store() {
        let remote = vec![record(9, "ABCDE", false)];
        let merged = merge(&[], &remote);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].code, "ABCDE");
        assert!(!merged[0].used);
    }

    #[test]
    fn test_local_usage_wins() {
        let mut local = record(1, "DEMO1", true);
        local.used_at = Some("2024-01-01T00:00:00Z".to_string());
        let remote = record(2, "DEMO1", false);

        let merged = merge(&[local], &[remote]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].used);
        assert_eq!(merged[0].used_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_remote_usage_fills_local() {
        let local = record(1, "DEMO1", false);
        let mut remote = record(2, "DEMO1", true);
        remote.used_at = Some("2024-03-03T00:00:00Z".to_string());
        remote.generated_at = "2030-01-01T00:00:00Z".to_string();

        let merged = merge(&[local], &[remote]);
        assert!(merged[0].used);
        assert_eq!(merged[0].used_at.as_deref(), Some("2024-03-03T00:00:00Z"));
        // identity fields stay local
        assert_eq!(merged[0].id, 1);
        assert_eq!(merged[0].generated_at, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_merge_usage_ledgers() {
        let mut local = UsageLedger::new();
        local.insert("AAAAA".into(), UsageEntry::default());
        local.insert(
            "BBBBB".into(),
            UsageEntry::used("2024-01-01T00:00:00Z", Some("gate-local".into())),
        );

        let mut remote = UsageLedger::new();
        remote.insert(
            "AAAAA".into(),
            UsageEntry::used("2024-05-05T00:00:00Z", Some("gate-remote".into())),
        );
        remote.insert("BBBBB".into(), UsageEntry::default());
        remote.insert("CCCCC".into(), UsageEntry::used("2024-06-06T00:00:00Z", None));

        let merged = merge_usage(&local, &remote);
        assert_eq!(merged.len(), 3);
        assert!(merged["AAAAA"].used);
        assert_eq!(merged["AAAAA"].used_at.as_deref(), Some("2024-05-05T00:00:00Z"));
        assert!(merged["BBBBB"].used);
        assert_eq!(merged["BBBBB"].device_id.as_deref(), Some("gate-local"));
        assert!(merged["CCCCC"].used);

        // applying the same ledger twice is the same as once
        assert_eq!(merge_usage(&merged, &remote), merged);
    }

    #[test]
    fn test_apply_usage_marks_existing_records() {
        let records = vec![record(1, "AAAAA", false), record(2, "BBBBB", false)];
        let mut ledger = UsageLedger::new();
        ledger.insert("AAAAA".into(), UsageEntry::used("2024-07-07T00:00:00Z", None));
        ledger.insert("ZZZZZ".into(), UsageEntry::used("2024-07-07T00:00:00Z", None));

        let applied = apply_usage(&records, &ledger);
        assert_eq!(applied.len(), 2);
        assert!(applied[0].used);
        assert_eq!(applied[0].used_at.as_deref(), Some("2024-07-07T00:00:00Z"));
        assert!(!applied[1].used);

        assert_eq!(apply_usage(&applied, &ledger), applied);
    }

    #[test]
    fn test_usage_from_records() {
        let records = vec![record(1, "AAAAA", true), record(2, "BBBBB", false)];
        let ledger = usage_from_records(&records);
        assert_eq!(ledger.len(), 1);
        assert!(ledger["AAAAA"].used);
    }
}
