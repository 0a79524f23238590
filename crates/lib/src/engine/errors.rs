//! Error types for the engine cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ErrorKind;

/// Errors raised while creating, lending or evicting engines.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine did not become live within the creation timeout.
    ///
    /// The creation task keeps running; a later acquire may find the engine ready.
    #[error("Engine for {path} was not ready within {timeout:?}")]
    CreationTimeout {
        /// Database path
        path: PathBuf,
        /// Configured creation timeout
        timeout: Duration,
    },

    /// The creation task failed. Every waiter receives the same shared cause.
    #[error("Failed to create engine for {path}: {source}")]
    CreationFailed {
        /// Database path
        path: PathBuf,
        /// Shared cause reported by the creation task
        #[source]
        source: Arc<crate::Error>,
    },

    /// An idle engine could not be sealed again; the previous ciphertext was restored.
    #[error("Failed to re-encrypt {path}: {source}")]
    ReEncryptionFailed {
        /// Database path
        path: PathBuf,
        /// What went wrong while sealing
        #[source]
        source: Box<crate::Error>,
    },

    /// A SQL operation on a live engine failed.
    #[error("{context}: {source}")]
    Sql {
        /// What the engine was doing
        context: String,
        /// The underlying sqlx error
        #[source]
        source: sqlx::Error,
    },

    /// The operation needs the database idle, but it is live or being created.
    #[error("Database {path} is in use")]
    Busy {
        /// Database path
        path: PathBuf,
    },

    /// The cache is shutting down and starts no new engines.
    #[error("Engine cache is shutting down; not opening {path}")]
    ShuttingDown {
        /// Database path
        path: PathBuf,
    },

    /// A background task panicked or was cancelled.
    #[error("Engine task failed: {reason}")]
    TaskFailed {
        /// Description of the failure
        reason: String,
    },
}

impl EngineError {
    /// Check if the engine was not ready in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::CreationTimeout { .. })
    }

    /// Check if the database was busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Busy { .. })
    }

    /// Get the database path if this error is about one.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            EngineError::CreationTimeout { path, .. }
            | EngineError::CreationFailed { path, .. }
            | EngineError::ReEncryptionFailed { path, .. }
            | EngineError::Busy { path }
            | EngineError::ShuttingDown { path } => Some(path),
            _ => None,
        }
    }

    /// Creation failures report the kind of their cause, so a tampered ciphertext
    /// still surfaces as [`ErrorKind::InvalidKey`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CreationTimeout { .. } => ErrorKind::EngineCreationTimeout,
            EngineError::CreationFailed { source, .. } => source.kind(),
            EngineError::ReEncryptionFailed { .. } => ErrorKind::ReEncryptionFailure,
            EngineError::Busy { .. } | EngineError::ShuttingDown { .. } => ErrorKind::Transient,
            EngineError::Sql { .. } | EngineError::TaskFailed { .. } => ErrorKind::Internal,
        }
    }
}

/// Map a join failure from `spawn_blocking` or `spawn` into an engine error.
pub(crate) fn task_failed(e: tokio::task::JoinError) -> crate::Error {
    EngineError::TaskFailed {
        reason: e.to_string(),
    }
    .into()
}
