//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/gatecode/config.toml)
//! 3. Environment variables (GATECODE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "GATECODE";

/// Default interval for the general re-check poll
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default interval for the fast "is sync needed" poll
pub const DEFAULT_FAST_POLL_INTERVAL_SECS: u64 = 3;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local code storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote replica URL (`ws://...`, or `memory` for an in-process store)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Whether remote sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Seconds between general re-checks of local state
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between fast "is sync needed" polls
    #[serde(default = "default_fast_poll_interval")]
    pub fast_poll_interval_secs: u64,

    /// Log file path (logs go to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            sync_enabled: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            fast_poll_interval_secs: DEFAULT_FAST_POLL_INTERVAL_SECS,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (GATECODE_DATA_DIR, GATECODE_REMOTE_URL, ...)
    /// 2. Config file (~/.config/gatecode/config.toml or GATECODE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the remote
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_POLL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_FAST_POLL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.fast_poll_interval_secs = secs;
            }
        }
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with GATECODE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gatecode")
            .join("config.toml")
    }

    /// Get the path to the full code collection
    pub fn codes_path(&self) -> PathBuf {
        self.data_dir.join("codes.json")
    }

    /// Get the path to the master usage ledger
    pub fn usage_ledger_path(&self) -> PathBuf {
        self.data_dir.join("master_usage.json")
    }

    /// Get the path to the sync timestamp marker
    pub fn sync_timestamp_path(&self) -> PathBuf {
        self.data_dir.join("sync_timestamp")
    }

    /// Remote URL, but only when sync is enabled
    pub fn active_remote(&self) -> Option<&str> {
        if self.sync_enabled {
            self.remote_url.as_deref()
        } else {
            None
        }
    }

    /// General re-check interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Fast "is sync needed" interval
    pub fn fast_poll_interval(&self) -> Duration {
        Duration::from_secs(self.fast_poll_interval_secs.max(1))
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatecode")
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_fast_poll_interval() -> u64 {
    DEFAULT_FAST_POLL_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "GATECODE_DATA_DIR",
        "GATECODE_REMOTE_URL",
        "GATECODE_SYNC_ENABLED",
        "GATECODE_POLL_SECS",
        "GATECODE_FAST_POLL_SECS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
        assert!(config.data_dir.ends_with("gatecode"));
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.fast_poll_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.codes_path().ends_with("codes.json"));
        assert!(config.usage_ledger_path().ends_with("master_usage.json"));
        assert!(config.sync_timestamp_path().ends_with("sync_timestamp"));
    }

    #[test]
    fn test_active_remote_requires_sync_enabled() {
        let mut config = Config {
            remote_url: Some("ws://localhost:4040".to_string()),
            ..Config::default()
        };
        assert!(config.active_remote().is_none());

        config.sync_enabled = true;
        assert_eq!(config.active_remote(), Some("ws://localhost:4040"));
    }

    #[test]
    fn test_env_override_remote_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("GATECODE_REMOTE_URL", "ws://localhost:4040");
        config.apply_env_overrides();
        assert_eq!(config.remote_url, Some("ws://localhost:4040".to_string()));

        env::set_var("GATECODE_REMOTE_URL", "");
        config.apply_env_overrides();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("GATECODE_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("GATECODE_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_poll_intervals() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("GATECODE_POLL_SECS", "30");
        env::set_var("GATECODE_FAST_POLL_SECS", "not-a-number");
        config.apply_env_overrides();
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.fast_poll_interval_secs, DEFAULT_FAST_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            remote_url = "ws://example.com"
            sync_enabled = true
            poll_interval_secs = 20
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.remote_url, Some("ws://example.com".to_string()));
        assert!(config.sync_enabled);
        assert_eq!(config.poll_interval_secs, 20);
        assert_eq!(config.fast_poll_interval_secs, DEFAULT_FAST_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            remote_url: Some("memory".to_string()),
            sync_enabled: true,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.remote_url, config.remote_url);
        assert!(loaded.sync_enabled);
        assert!(loaded.data_dir.exists());
    }
}
