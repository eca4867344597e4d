//! Remote replica errors

use std::time::Duration;

use thiserror::Error;

/// Errors talking to the remote replica
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport is not connected or refused the request
    #[error("Remote store unreachable: {0}")]
    Unavailable(String),

    /// No reply within the request deadline
    #[error("Remote request timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected the request
    #[error("Remote store error: {0}")]
    Server(String),

    /// A payload could not be encoded or decoded
    #[error("Invalid remote payload: {0}")]
    Encoding(String),

    /// The connection closed while a request was pending
    #[error("Remote connection closed")]
    Closed,
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Encoding(e.to_string())
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;
