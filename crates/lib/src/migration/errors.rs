//! Error types for the migration runner.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ErrorKind;

/// Errors that stop a database from reaching its head revision.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` and `kind()` are the stable API
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No chain of steps leads from the stored revision to the head.
    #[error("Schema {schema}: no migration path from revision {from} to {head}")]
    NoPath {
        /// Schema name
        schema: String,
        /// Revision where the chain broke
        from: i64,
        /// Target revision
        head: i64,
    },

    /// The database was written by a newer build.
    #[error("Schema {schema}: database is at revision {found}, newer than head {head}")]
    AheadOfHead {
        /// Schema name
        schema: String,
        /// Revision stamped in the database
        found: i64,
        /// Head revision known to this build
        head: i64,
    },

    /// A DDL or data statement failed.
    #[error("Schema {schema}: statement failed: {statement}")]
    Statement {
        /// Schema name
        schema: String,
        /// The failing statement
        statement: String,
        /// The underlying sqlx error
        #[source]
        source: sqlx::Error,
    },

    /// Reading or writing the revision marker failed.
    #[error("{context}")]
    Sql {
        /// What the runner was doing
        context: String,
        /// The underlying sqlx error
        #[source]
        source: sqlx::Error,
    },

    /// Another process held the migration lock for too long.
    #[error("Timed out after {waited:?} waiting for migration lock {path}")]
    LockTimeout {
        /// Lock file
        path: PathBuf,
        /// How long we waited
        waited: Duration,
    },

    /// The lock file could not be created or removed.
    #[error("Migration lock I/O error on {path}")]
    LockIo {
        /// Lock file
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl MigrationError {
    /// Check if this error is about the cross-process lock.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            MigrationError::LockTimeout { .. } | MigrationError::LockIo { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_lock_error() {
            ErrorKind::Transient
        } else {
            ErrorKind::MigrationFailure
        }
    }
}
