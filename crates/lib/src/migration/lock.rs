//! Cross-process migration lock.
//!
//! A lock is a file created with `create_new`, so exactly one process can hold it.
//! Waiters poll at a fixed interval. A lock file older than [`STALE_AFTER`] is
//! assumed to belong to a dead process and is removed.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use super::MigrationError;
use crate::Result;
use crate::cipher::remove_if_present;

/// Age after which an existing lock file is reclaimed.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// A held migration lock. Released on drop.
#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
}

impl MigrationLock {
    /// Take the lock at `path`, retrying every `retry` for at most `timeout`.
    pub async fn acquire(path: &Path, timeout: Duration, retry: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            match try_create(path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Acquired migration lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(path, STALE_AFTER) {
                        tracing::warn!(path = %path.display(), "Reclaiming stale migration lock");
                        remove_if_present(path).map_err(|source| MigrationError::LockIo {
                            path: path.to_path_buf(),
                            source,
                        })?;
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(MigrationError::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        }
                        .into());
                    }
                    tokio::time::sleep(retry).await;
                }
                Err(source) => {
                    return Err(MigrationError::LockIo {
                        path: path.to_path_buf(),
                        source,
                    }
                    .into());
                }
            }
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to release migration lock");
        }
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn is_stale(path: &Path, max_age: Duration) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}
