//! Error types for the account facade.

use std::path::PathBuf;

use thiserror::Error;

use crate::ErrorKind;
use crate::keys::Uid;

/// Errors from account-level operations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AccountError {
    /// No account exists for this user.
    #[error("User not found: {uid}")]
    UserNotFound {
        /// User that was looked up
        uid: Uid,
    },

    /// The account already exists.
    #[error("User already exists: {uid}")]
    UserExists {
        /// User that was registered twice
        uid: Uid,
    },

    /// The user's data directory is not mounted.
    #[error("Storage for user is not available at {path}")]
    StorageUnavailable {
        /// Expected user directory
        path: PathBuf,
    },

    /// A database name would escape its service directory or clash with a sidecar.
    #[error("Invalid database name: {name:?}")]
    InvalidDatabaseName {
        /// The rejected name
        name: String,
    },
}

impl AccountError {
    /// Check if this error is about a missing user.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AccountError::UserNotFound { .. })
    }

    /// Check if the caller can retry once storage is mounted.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, AccountError::StorageUnavailable { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountError::UserNotFound { .. } => ErrorKind::NotFound,
            AccountError::UserExists { .. } => ErrorKind::AlreadyExists,
            AccountError::StorageUnavailable { .. } => ErrorKind::Transient,
            AccountError::InvalidDatabaseName { .. } => ErrorKind::NotFound,
        }
    }
}
