//! Error types for the stored-key vault.

use std::path::PathBuf;

use thiserror::Error;

use crate::ErrorKind;

/// Errors from wrapping, persisting and loading keys.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VaultError {
    /// The wrapping key did not authenticate the blob.
    #[error("Wrapped key could not be opened: wrong key or tampered data")]
    InvalidKey,

    /// A wrapped-key blob is too short to hold a nonce and a tag.
    #[error("Wrapped key is malformed: {len} bytes")]
    Malformed {
        /// Length of the blob
        len: usize,
    },

    /// Freshly written key material did not read back correctly.
    #[error("Key material at {path} failed verification: {reason}")]
    KeyMaterialCorrupt {
        /// File that was rolled back
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Refused to overwrite an existing key file.
    #[error("Key file already exists: {path}")]
    AlreadyExists {
        /// The existing file
        path: PathBuf,
    },

    /// No key file at the given path.
    #[error("Key file not found: {path}")]
    NotFound {
        /// The missing file
        path: PathBuf,
    },

    /// Raw key bytes have the wrong length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// A textual key is not valid base64.
    #[error("Invalid key encoding")]
    InvalidEncoding,

    /// The AEAD implementation refused to encrypt.
    #[error("Key wrapping failed: {reason}")]
    WrapFailed {
        /// Description from the AEAD backend
        reason: String,
    },

    /// File I/O error.
    #[error("File I/O error on {path}")]
    Io {
        /// File being read or written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl VaultError {
    /// Check if this error means the wrapping key was wrong or the blob was tampered with.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, VaultError::InvalidKey | VaultError::Malformed { .. })
    }

    /// Check if this error indicates a key file was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound { .. })
    }

    /// Check if this error is related to I/O operations.
    pub fn is_io_error(&self) -> bool {
        matches!(self, VaultError::Io { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidKey | VaultError::Malformed { .. } => ErrorKind::InvalidKey,
            VaultError::KeyMaterialCorrupt { .. } => ErrorKind::KeyMaterialCorrupt,
            VaultError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            VaultError::NotFound { .. } => ErrorKind::NotFound,
            VaultError::InvalidKeyLength { .. } => ErrorKind::InvalidKey,
            VaultError::InvalidEncoding | VaultError::WrapFailed { .. } => ErrorKind::Internal,
            VaultError::Io { .. } => ErrorKind::Transient,
        }
    }
}
