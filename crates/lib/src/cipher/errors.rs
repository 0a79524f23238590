//! Error types for the chunked file cipher.

use std::path::PathBuf;

use thiserror::Error;

use crate::ErrorKind;

/// Errors raised while sealing or opening chunked ciphertext.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CipherError {
    /// The plaintext or ciphertext input does not exist.
    #[error("Input file missing: {path}")]
    InputMissing {
        /// Path that was expected to exist
        path: PathBuf,
    },

    /// The output path is already taken.
    #[error("Output file already exists: {path}")]
    OutputExists {
        /// Path that was expected to be free
        path: PathBuf,
    },

    /// A record failed authentication under the supplied key.
    #[error("Chunk {chunk} failed authentication: wrong key or tampered data")]
    InvalidKey {
        /// Zero-based index of the failing record
        chunk: u64,
    },

    /// A record is too short to hold a nonce and a tag.
    #[error("Chunk {chunk} is malformed: {len} bytes")]
    Malformed {
        /// Zero-based index of the failing record
        chunk: u64,
        /// Bytes actually read
        len: usize,
    },

    /// The freshly written ciphertext did not decrypt back to the source.
    #[error("Ciphertext at {path} failed self-verification")]
    VerificationFailed {
        /// Output that was removed
        path: PathBuf,
    },

    /// The AEAD implementation refused to encrypt.
    #[error("Encryption failed: {reason}")]
    EncryptionFailed {
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

impl CipherError {
    /// Check if this error means the key did not authenticate the data.
    pub fn is_invalid_key(&self) -> bool {
        matches!(
            self,
            CipherError::InvalidKey { .. } | CipherError::Malformed { .. }
        )
    }

    /// Check if this error is related to I/O operations.
    pub fn is_io_error(&self) -> bool {
        matches!(self, CipherError::Io { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CipherError::InputMissing { .. } => ErrorKind::InputMissing,
            CipherError::OutputExists { .. } => ErrorKind::OutputExists,
            CipherError::InvalidKey { .. } | CipherError::Malformed { .. } => {
                ErrorKind::InvalidKey
            }
            CipherError::VerificationFailed { .. } | CipherError::EncryptionFailed { .. } => {
                ErrorKind::Internal
            }
            CipherError::Io { .. } => ErrorKind::Transient,
        }
    }
}
