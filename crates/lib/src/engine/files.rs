//! File protocol for one database path.
//!
//! The state of a database is journalled purely by which files exist:
//!
//! ```text
//! idle      P.enc
//! live      P + P.old
//! sealing   P + P.old + P.enc.tmp      -> P.enc, then P and P.old removed
//! ```
//!
//! [`DatabaseFiles::recover`] maps every state a crash can leave behind back to
//! `idle` before an engine is opened. Everything here is blocking I/O.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::cipher::{self, CipherError, remove_if_present};
use crate::constants::{
    CIPHERTEXT_SUFFIX, JOURNAL_SUFFIX, MIGRATION_LOCK_SUFFIX, PARTIAL_SUFFIX, ROLLBACK_SUFFIX,
    STAGING_SUFFIX,
};
use crate::keys::DataKey;
use crate::paths::sidecar;
use crate::vault::write_private;
use crate::{Error, Result};

/// What [`DatabaseFiles::recover`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Only the ciphertext existed.
    Clean,
    /// The ciphertext was missing and `P.old` was moved back into place.
    RestoredRollback,
    /// Only a plaintext existed; it was sealed with the current key.
    ResealedPlaintext,
    /// Nothing existed; an empty database was sealed.
    Initialized,
    /// The ciphertext existed next to leftovers, which were removed.
    RemovedStale,
}

impl Recovery {
    pub fn is_clean(self) -> bool {
        matches!(self, Recovery::Clean | Recovery::Initialized)
    }
}

/// Every file name derived from one database path.
#[derive(Debug, Clone)]
pub(crate) struct DatabaseFiles {
    pub(crate) plain: PathBuf,
    pub(crate) sealed: PathBuf,
    pub(crate) rollback: PathBuf,
    pub(crate) staging: PathBuf,
    pub(crate) partial: PathBuf,
    pub(crate) journal: PathBuf,
    pub(crate) lock: PathBuf,
}

impl DatabaseFiles {
    pub(crate) fn new(path: &Path) -> Self {
        let sealed = sidecar(path, CIPHERTEXT_SUFFIX);
        Self {
            plain: path.to_path_buf(),
            staging: sidecar(&sealed, STAGING_SUFFIX),
            sealed,
            rollback: sidecar(path, ROLLBACK_SUFFIX),
            partial: sidecar(path, PARTIAL_SUFFIX),
            journal: sidecar(path, JOURNAL_SUFFIX),
            lock: sidecar(path, MIGRATION_LOCK_SUFFIX),
        }
    }

    /// Bring the path back to the idle state, sealing with `key` where needed.
    pub(crate) fn recover(&self, key: &DataKey) -> Result<Recovery> {
        if self.sealed.exists() {
            let mut stale = false;
            for leftover in [
                &self.plain,
                &self.rollback,
                &self.staging,
                &self.partial,
                &self.journal,
            ] {
                if leftover.symlink_metadata().is_ok() {
                    tracing::warn!(path = %leftover.display(), "Removing stale database file");
                    fs::remove_file(leftover).map_err(io_at(leftover))?;
                    stale = true;
                }
            }
            return Ok(if stale {
                Recovery::RemovedStale
            } else {
                Recovery::Clean
            });
        }

        if self.rollback.exists() {
            tracing::warn!(path = %self.plain.display(), "Restoring ciphertext from rollback copy");
            self.discard_plaintext()?;
            fs::rename(&self.rollback, &self.sealed).map_err(io_at(&self.sealed))?;
            return Ok(Recovery::RestoredRollback);
        }

        if self.plain.exists() {
            tracing::warn!(path = %self.plain.display(), "Sealing orphaned plaintext");
            self.seal_plaintext(key)?;
            self.discard_plaintext()?;
            return Ok(Recovery::ResealedPlaintext);
        }

        if let Some(parent) = self.plain.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        tracing::debug!(path = %self.plain.display(), "Initializing empty database");
        write_private(&self.plain, b"").map_err(io_at(&self.plain))?;
        self.seal_plaintext(key)?;
        self.discard_plaintext()?;
        Ok(Recovery::Initialized)
    }

    /// Decrypt `P.enc` to `P`, then park the ciphertext at `P.old`.
    pub(crate) fn open(&self, key: &DataKey) -> Result<u64> {
        let bytes = cipher::decrypt_file(&self.sealed, &self.plain, key)?;
        if let Err(e) = fs::rename(&self.sealed, &self.rollback) {
            let _ = remove_if_present(&self.plain);
            return Err(io_at(&self.rollback)(e));
        }
        tracing::debug!(path = %self.plain.display(), bytes, "Opened database");
        Ok(bytes)
    }

    /// Undo [`open`](Self::open): drop the plaintext and move `P.old` back.
    pub(crate) fn abort_open(&self) -> Result<()> {
        self.discard_plaintext()?;
        if self.rollback.exists() && !self.sealed.exists() {
            fs::rename(&self.rollback, &self.sealed).map_err(io_at(&self.sealed))?;
        }
        Ok(())
    }

    /// Seal `P` into `P.enc` and remove the plaintext and the rollback copy.
    ///
    /// On failure the ciphertext from `P.old` is restored and the plaintext is
    /// discarded, so changes made since the engine opened are lost.
    pub(crate) fn seal(&self, key: &DataKey) -> Result<()> {
        match self.seal_plaintext(key) {
            Ok(()) => {
                self.discard_plaintext()?;
                remove_if_present(&self.rollback).map_err(io_at(&self.rollback))?;
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self.abort_open() {
                    tracing::error!(
                        path = %self.plain.display(),
                        error = %restore,
                        "Failed to restore rollback copy"
                    );
                }
                Err(e)
            }
        }
    }

    /// Re-encrypt an idle database from `old` to `new`.
    pub(crate) fn rekey(&self, old: &DataKey, new: &DataKey) -> Result<()> {
        cipher::decrypt_file(&self.sealed, &self.plain, old)?;
        let sealed = self.seal_plaintext(new);
        self.discard_plaintext()?;
        sealed
    }

    /// Encrypt `P` into the staging file and rename it over `P.enc`.
    fn seal_plaintext(&self, key: &DataKey) -> Result<()> {
        remove_if_present(&self.staging).map_err(io_at(&self.staging))?;
        let sealed = cipher::encrypt_file(&self.plain, &self.staging, key)
            .and_then(|_| fs::rename(&self.staging, &self.sealed).map_err(io_at(&self.sealed)));
        if sealed.is_err() {
            let _ = remove_if_present(&self.staging);
        }
        sealed
    }

    fn discard_plaintext(&self) -> Result<()> {
        for path in [&self.plain, &self.journal, &self.partial] {
            remove_if_present(path).map_err(io_at(path))?;
        }
        Ok(())
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| {
        CipherError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()
    }
}
