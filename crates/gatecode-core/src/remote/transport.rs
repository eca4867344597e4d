//! Transport seam for the remote replica
//!
//! The remote side is a flat key/value realtime store addressed by
//! slash-separated paths. Values are JSON documents.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::error::RemoteResult;

/// A value change observed under a subscribed prefix
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub path: String,
    pub value: Value,
}

/// Access to the shared remote store
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Overwrite the value at `path`
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()>;

    /// Read the value at `path`
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>>;

    /// Read every entry whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> RemoteResult<Vec<(String, Value)>>;

    /// Stream changes under `prefix`
    ///
    /// The current entries are delivered first. The stream ends when the
    /// receiver is dropped or the transport shuts down.
    async fn subscribe(&self, prefix: &str) -> RemoteResult<mpsc::UnboundedReceiver<RemoteEvent>>;
}

/// Whether `path` lies under `prefix`
pub(crate) fn matches_prefix(path: &str, prefix: &str) -> bool {
    path.starts_with(prefix)
}
