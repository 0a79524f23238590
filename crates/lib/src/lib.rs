//!
//! Lockbox: per-user encrypted SQLite databases behind a rotating key hierarchy.
//!
//! Every user owns a handful of small SQLite databases that only ever rest on disk
//! in encrypted form. This crate decrypts them on demand, serves them to concurrent
//! request handlers through short transactional sessions, and seals them again once
//! nobody has used them for a while.
//!
//! ## Core Concepts
//!
//! * **Chunked cipher (`cipher`)**: Streams a file through AES-128-GCM in 8 KiB records,
//!   each carrying its own nonce and tag.
//! * **Vault (`vault`)**: Wraps small keys under a key-encryption key and persists them
//!   with a `.prev` sidecar so a failed overwrite can always be rolled back.
//! * **Keyring (`keyring`)**: The per-user bundle of service KEKs, sealed under a keyring
//!   key that travels inside the bearer token and is rotated on every login.
//! * **Migration runner (`migration`)**: Brings a freshly opened database to the head
//!   revision of its `Schema`.
//! * **Engine cache (`engine`)**: One live `SqlitePool` per database path, handed out as
//!   reference-counted `Session`s and evicted after an idle grace period.
//! * **Accounts (`accounts`)**: Ties the pieces together for request handlers.

pub mod accounts;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod constants;
pub mod engine;
pub mod keyring;
pub mod keys;
pub mod migration;
pub mod paths;
pub mod token;
pub mod vault;

pub use accounts::{Accounts, DatabaseRef};
#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use clock::{Clock, SystemClock};
pub use config::{Deployment, EngineConfig, LockboxConfig};
pub use engine::{EngineCache, EngineState, Recovery, Session, StatsSnapshot};
pub use keyring::{Keyring, ServiceNamespace};
pub use keys::{DataKey, Uid, WrappingKey};
pub use migration::{MigrationOutcome, Schema};
pub use token::{IssuedToken, TokenIssuer};

/// Result type used throughout the Lockbox library.
pub type Result<T> = std::result::Result<T, Error>;

/// Observable failure classes.
///
/// Every [`Error`] maps onto exactly one kind so the request layer can turn it into
/// a response without inspecting module-specific variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A key failed to authenticate ciphertext (wrong key or tampered data).
    InvalidKey,
    /// Freshly written key material did not survive its own read-back check.
    KeyMaterialCorrupt,
    /// Waiting for an engine to be created took longer than the creation timeout.
    EngineCreationTimeout,
    /// The schema could not be brought to its head revision.
    MigrationFailure,
    /// An idle engine could not be re-encrypted and was rolled back.
    ReEncryptionFailure,
    /// A retryable condition such as an I/O failure or a held lock.
    Transient,
    /// The plaintext input of an encryption or decryption was missing.
    InputMissing,
    /// The output of an encryption or decryption already existed.
    OutputExists,
    /// A user, key or file does not exist.
    NotFound,
    /// A user or file already exists.
    AlreadyExists,
    /// The bearer token was rejected.
    Unauthorized,
    /// Anything else: SQL errors, serialization, failed background tasks.
    Internal,
}

/// Common error type for the Lockbox library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured errors from the chunked file cipher
    #[error(transparent)]
    Cipher(#[from] cipher::CipherError),

    /// Structured errors from the key vault
    #[error(transparent)]
    Vault(#[from] vault::VaultError),

    /// Structured errors from the keyring
    #[error(transparent)]
    Keyring(#[from] keyring::KeyringError),

    /// Structured errors from bearer token handling
    #[error(transparent)]
    Token(#[from] token::TokenError),

    /// Structured errors from the migration runner
    #[error(transparent)]
    Migration(#[from] migration::MigrationError),

    /// Structured errors from the engine cache
    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    /// Structured errors from the account facade
    #[error(transparent)]
    Account(#[from] accounts::AccountError),
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        engine::EngineError::Sql {
            context: "query failed".to_string(),
            source,
        }
        .into()
    }
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
            Error::Cipher(_) => "cipher",
            Error::Vault(_) => "vault",
            Error::Keyring(_) => "keyring",
            Error::Token(_) => "token",
            Error::Migration(_) => "migration",
            Error::Engine(_) => "engine",
            Error::Account(_) => "accounts",
        }
    }

    /// Classify this error into one of the observable failure kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Transient,
            Error::Serialize(_) => ErrorKind::Internal,
            Error::Cipher(e) => e.kind(),
            Error::Vault(e) => e.kind(),
            Error::Keyring(e) => e.kind(),
            Error::Token(e) => e.kind(),
            Error::Migration(e) => e.kind(),
            Error::Engine(e) => e.kind(),
            Error::Account(e) => e.kind(),
        }
    }

    /// Check if this error means a key did not authenticate its ciphertext.
    pub fn is_invalid_key(&self) -> bool {
        self.kind() == ErrorKind::InvalidKey
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error indicates a conflict (already exists).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AlreadyExists | ErrorKind::OutputExists
        )
    }

    /// Check if this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if the caller should be told to re-authenticate.
    pub fn is_authentication_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unauthorized | ErrorKind::InvalidKey)
    }

    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Cipher(e) => e.is_io_error(),
            Error::Vault(e) => e.is_io_error(),
            _ => false,
        }
    }
}
