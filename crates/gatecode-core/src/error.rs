//! Error taxonomy for code operations
//!
//! Only record-identity errors (`Validation`, `NotFound`, `AlreadyUsed`,
//! `Duplicate`) are meant for end users. Remote failures are absorbed at the
//! sync boundary and storage corruption degrades to an empty store.

use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Errors surfaced by code operations
#[derive(Error, Debug)]
pub enum CodeError {
    /// Malformed code input
    #[error("Invalid code: {0}")]
    Validation(String),

    /// No record matches the code
    #[error("Invalid code. Please check and try again.")]
    NotFound { code: String },

    /// The matched record has already been redeemed
    #[error("This code has already been used.")]
    AlreadyUsed {
        code: String,
        used_at: Option<String>,
    },

    /// Strict insert of a code that already exists
    #[error("Code {0} already exists")]
    Duplicate(String),

    /// Remote replica could not be reached
    #[error("Remote replica unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),

    /// Local data could not be parsed
    #[error("Local storage is corrupt: {0}")]
    StorageCorrupt(String),

    /// Local storage I/O failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CodeError {
    /// Whether the message is meant to be shown to the end user verbatim
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CodeError::Validation(_)
                | CodeError::NotFound { .. }
                | CodeError::AlreadyUsed { .. }
                | CodeError::Duplicate(_)
        )
    }
}

/// Result type for code operations
pub type CodeResult<T> = Result<T, CodeError>;
