//! Error types for bearer token handling.

use thiserror::Error;

use crate::ErrorKind;

/// Reasons a bearer token is refused or could not be issued.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TokenError {
    /// Not a well-formed token, or the claims do not parse.
    #[error("Malformed token")]
    Malformed,

    /// The signature does not match the server secret.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// The token's lifetime has ended.
    #[error("Token expired at {expired_at}")]
    Expired {
        /// Expiry as seconds since the Unix epoch
        expired_at: i64,
    },

    /// The embedded keyring key does not decode to a key.
    #[error("Token carries an invalid keyring key")]
    InvalidKeyringKey,

    /// Signing failed.
    #[error("Token could not be issued: {reason}")]
    IssueFailed {
        /// Description from the JWT library
        reason: String,
    },
}

impl TokenError {
    /// Check if the caller simply needs a fresh token.
    pub fn is_expired(&self) -> bool {
        matches!(self, TokenError::Expired { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::IssueFailed { .. } => ErrorKind::Internal,
            _ => ErrorKind::Unauthorized,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            _ => TokenError::Malformed,
        }
    }
}
