//! Error types for keyring operations.

use thiserror::Error;

use super::ServiceNamespace;
use crate::ErrorKind;
use crate::keys::Uid;

/// Errors from creating, rotating and opening a user's keyring.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum KeyringError {
    /// A keyring already exists for this user.
    #[error("Keyring already exists for user {uid}")]
    AlreadyExists {
        /// Owner of the existing keyring
        uid: Uid,
    },

    /// No keyring on disk for this user.
    #[error("No keyring for user {uid}")]
    NotFound {
        /// User that was looked up
        uid: Uid,
    },

    /// The decrypted record belongs to someone else.
    #[error("Keyring belongs to {found}, expected {expected}")]
    UidMismatch {
        /// User the caller asked for
        expected: Uid,
        /// User recorded in the keyring
        found: Uid,
    },

    /// The keyring predates a namespace; the user must log in again to add it.
    #[error("Keyring has no key for namespace {namespace}")]
    NamespaceMissing {
        /// The namespace without a KEK
        namespace: ServiceNamespace,
    },

    /// The decrypted record could not be parsed.
    #[error("Keyring record is malformed: {reason}")]
    Malformed {
        /// Parser message
        reason: String,
    },

    /// The rotated keyring did not validate and both files were rolled back.
    #[error("Keyring for user {uid} failed validation: {reason}")]
    KeyMaterialCorrupt {
        /// Owner of the keyring
        uid: Uid,
        /// What went wrong
        reason: String,
    },
}

impl KeyringError {
    /// Check if this error indicates a keyring was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyringError::NotFound { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyringError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            KeyringError::NotFound { .. } => ErrorKind::NotFound,
            KeyringError::UidMismatch { .. } | KeyringError::NamespaceMissing { .. } => {
                ErrorKind::Unauthorized
            }
            KeyringError::Malformed { .. } | KeyringError::KeyMaterialCorrupt { .. } => {
                ErrorKind::KeyMaterialCorrupt
            }
        }
    }
}
