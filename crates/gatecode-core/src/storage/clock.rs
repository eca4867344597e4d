//! Sync timestamp
//!
//! A monotonically advancing ISO-8601 marker recorded whenever local state
//! changes. Values compare lexically, so the clock never hands out a value
//! that sorts before or equal to the previous one.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::warn;

use super::persistence::FilePersistence;
use crate::models::now_iso;

/// Shared, persisted sync timestamp
#[derive(Clone)]
pub struct SyncClock {
    persistence: Option<Arc<FilePersistence>>,
    last: Arc<Mutex<Option<String>>>,
}

impl SyncClock {
    /// In-memory clock (nothing persisted)
    pub fn in_memory() -> Self {
        Self {
            persistence: None,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Clock persisted next to the code collection
    pub fn persisted(persistence: Arc<FilePersistence>) -> Self {
        let initial = persistence.read_sync_timestamp().ok().flatten();
        Self {
            persistence: Some(persistence),
            last: Arc::new(Mutex::new(initial)),
        }
    }

    /// Advance the clock and return the new value
    pub fn advance(&self) -> String {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        // Another process may have advanced the persisted value
        if let Some(on_disk) = self.read_persisted() {
            if last.as_deref().map_or(true, |l| on_disk.as_str() > l) {
                *last = Some(on_disk);
            }
        }

        let mut next = now_iso();
        if let Some(prev) = last.as_deref() {
            if next.as_str() <= prev {
                next = bump(prev);
            }
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.write_sync_timestamp(&next) {
                warn!("Failed to persist sync timestamp: {}", e);
            }
        }

        *last = Some(next.clone());
        next
    }

    /// Current value, preferring whatever is on disk
    pub fn current(&self) -> Option<String> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(on_disk) = self.read_persisted() {
            if last.as_deref().map_or(true, |l| on_disk.as_str() > l) {
                *last = Some(on_disk);
            }
        }
        last.clone()
    }

    /// Forget the timestamp (explicit wipe only)
    pub fn reset(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = None;
    }

    fn read_persisted(&self) -> Option<String> {
        self.persistence
            .as_ref()
            .and_then(|p| p.read_sync_timestamp().ok().flatten())
    }
}

/// One millisecond after `prev`, or `prev` with a suffix if it doesn't parse
fn bump(prev: &str) -> String {
    match DateTime::parse_from_rfc3339(prev) {
        Ok(parsed) => (parsed.with_timezone(&Utc) + Duration::milliseconds(1))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        Err(_) => format!("{}~", prev),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[test]
    fn test_advance_is_strictly_increasing() {
        let clock = SyncClock::in_memory();
        let mut prev = clock.advance();
        for _ in 0..100 {
            let next = clock.advance();
            assert!(next > prev, "{} should sort after {}", next, prev);
            prev = next;
        }
        assert_eq!(clock.current(), Some(prev));
    }

    #[test]
    fn test_advance_past_future_value() {
        let clock = SyncClock::in_memory();
        *clock.last.lock().unwrap() = Some("2999-01-01T00:00:00.000Z".to_string());

        assert_eq!(clock.advance(), "2999-01-01T00:00:00.001Z");
    }

    #[test]
    fn test_persisted_clock_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };

        let first = SyncClock::persisted(Arc::new(FilePersistence::new(config.clone())));
        let value = first.advance();

        let second = SyncClock::persisted(Arc::new(FilePersistence::new(config)));
        assert_eq!(second.current(), Some(value.clone()));
        assert!(second.advance() > value);
    }

    #[test]
    fn test_reset() {
        let clock = SyncClock::in_memory();
        clock.advance();
        clock.reset();
        assert!(clock.current().is_none());
    }
}
