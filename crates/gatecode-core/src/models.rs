//! Data models for gatecode
//!
//! Defines the access code record, the loose shape records arrive in from
//! disk or other replicas, and the usage ledger entries.
//!
//! All defaults are applied in one place: [`normalize`]. Everything past the
//! Local Store boundary works with [`CodeRecord`] and may assume it is
//! normalized.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CodeError;

/// Alphabet used for generated codes
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated codes
pub const GENERATED_CODE_LEN: usize = 5;

/// Maximum length accepted for custom codes
pub const MAX_CUSTOM_CODE_LEN: usize = 32;

/// Master usage ledger: normalized code -> usage fact
pub type UsageLedger = BTreeMap<String, UsageEntry>;

/// A single-use access code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CodeRecord {
    /// Local convenience key, not identity across replicas
    pub id: u64,
    /// Normalized code (trimmed, uppercase); the identity
    pub code: String,
    /// Whether the code has been redeemed
    pub used: bool,
    /// When the code was created (ISO-8601)
    pub generated_at: String,
    /// When the code was redeemed (ISO-8601)
    pub used_at: Option<String>,
}

impl CodeRecord {
    /// Create a fresh, unused record for the given code
    pub fn new(code: impl AsRef<str>) -> Self {
        Self {
            id: random_id(),
            code: normalize_code(code.as_ref()),
            used: false,
            generated_at: now_iso(),
            used_at: None,
        }
    }

    /// Mark the record used; the first `used_at` sticks
    pub fn mark_used(&mut self, used_at: impl Into<String>) {
        if !self.used {
            self.used = true;
        }
        if self.used_at.is_none() {
            self.used_at = Some(used_at.into());
        }
    }
}

/// A record as it may arrive from storage or another replica
///
/// Every field is optional; `id` is accepted as a number or a numeric
/// string since replicas are not trusted to agree on its type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawCodeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub used: Option<bool>,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub used_at: Option<String>,
}

impl From<CodeRecord> for RawCodeRecord {
    fn from(record: CodeRecord) -> Self {
        Self {
            id: Some(serde_json::Value::from(record.id)),
            code: Some(record.code),
            used: Some(record.used),
            generated_at: Some(record.generated_at),
            used_at: record.used_at,
        }
    }
}

/// Usage fact recorded in the master usage ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub used_at: Option<String>,
    /// Device that redeemed the code, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl UsageEntry {
    /// A usage fact for a code redeemed at `used_at`
    pub fn used(used_at: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            used: true,
            used_at: Some(used_at.into()),
            device_id,
        }
    }

    /// Fill a placeholder `used_at` for used entries that arrive without one
    pub fn normalized(mut self) -> Self {
        if self.used && self.used_at.is_none() {
            self.used_at = Some(now_iso());
        }
        if !self.used {
            self.used_at = None;
        }
        self
    }
}

/// Normalize a raw record into a [`CodeRecord`]
///
/// Fails with [`CodeError::Validation`] when the code is empty after
/// trimming.
pub fn normalize(raw: RawCodeRecord) -> Result<CodeRecord, CodeError> {
    let code = normalize_code(raw.code.as_deref().unwrap_or_default());
    if code.is_empty() {
        return Err(CodeError::Validation("code must not be empty".to_string()));
    }

    let used = raw.used.unwrap_or(false);
    let used_at = if used {
        Some(raw.used_at.unwrap_or_else(now_iso))
    } else {
        None
    };

    Ok(CodeRecord {
        id: raw.id.as_ref().and_then(parse_id).unwrap_or_else(random_id),
        code,
        used,
        generated_at: raw.generated_at.unwrap_or_else(now_iso),
        used_at,
    })
}

/// Re-normalize an already typed record (code casing, used implies usedAt)
pub fn normalize_record(record: CodeRecord) -> Result<CodeRecord, CodeError> {
    normalize(record.into())
}

/// Normalize a code string: trimmed and uppercased
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Validate a custom code chosen by an operator
pub fn validate_custom_code(code: &str) -> Result<String, CodeError> {
    let code = normalize_code(code);
    if code.is_empty() {
        return Err(CodeError::Validation("code must not be empty".to_string()));
    }
    if code.len() > MAX_CUSTOM_CODE_LEN {
        return Err(CodeError::Validation(format!(
            "code must be at most {} characters",
            MAX_CUSTOM_CODE_LEN
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CodeError::Validation(
            "code may only contain letters and digits".to_string(),
        ));
    }
    Ok(code)
}

/// Generate a random 5-character uppercase code
pub fn generate_code_string() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Fresh random record id
pub fn random_id() -> u64 {
    rand::thread_rng().gen_range(1..=u64::from(u32::MAX))
}

/// Current time as an ISO-8601 string with millisecond precision
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_id(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
