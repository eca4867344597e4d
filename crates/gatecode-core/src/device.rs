//! Device identity
//!
//! Each running process gets an ephemeral device id. It is only used to
//! recognize our own snapshots when the remote replica echoes them back;
//! it is never persisted and carries no ownership of codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix for generated device ids
const DEVICE_PREFIX: &str = "gate";

/// Ephemeral identity of this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Random per-session id
    pub id: String,
    /// Platform string, e.g. `linux-x86_64`
    pub platform: String,
}

impl Device {
    /// Generate a fresh device identity for this session
    pub fn generate() -> Self {
        let id = format!(
            "{}-{}",
            DEVICE_PREFIX,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self::with_id(id)
    }

    /// Device with a specific id (tests, multi-engine setups)
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: platform(),
        }
    }

    /// Whether a snapshot tagged with `device_id` came from this device
    pub fn is_self(&self, device_id: &str) -> bool {
        self.id == device_id
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.platform)
    }
}

/// `<os>-<arch>` of the running binary
pub fn platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
