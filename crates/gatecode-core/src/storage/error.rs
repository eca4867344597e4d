//! Storage errors
//!
//! I/O failures are classified so the caller can tell "fix your disk"
//! apart from "the file is garbage".

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// What the store was doing when I/O failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Remove,
    /// Renaming a finished temp file over the target
    Replace,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Remove => "remove",
            IoOp::Replace => "replace",
        })
    }
}

/// Errors from the on-disk code store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Permission denied on '{path}'. Check permissions on the data directory.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No space left while writing '{path}'. Free up disk space and try again.")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not {op} '{path}': {source}")]
    Io {
        op: IoOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File exists but does not hold what we wrote
    #[error("'{path}' is not valid code data: {details}")]
    Corrupt { path: PathBuf, details: String },

    #[error("Could not encode data for '{path}': {details}")]
    Encode { path: PathBuf, details: String },
}

impl StorageError {
    /// Classify an I/O error raised while doing `op` on `path`
    pub fn io(op: IoOp, error: io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::Io {
                op,
                path,
                source: error,
            },
        }
    }
}

fn is_disk_full(error: &io::Error) -> bool {
    // ENOSPC
    if cfg!(unix) && error.raw_os_error() == Some(28) {
        return true;
    }
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("quota exceeded")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
