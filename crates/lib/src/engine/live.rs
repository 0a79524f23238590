//! A live engine: the connection pool over one decrypted database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::errors::{EngineError, task_failed};
use super::files::DatabaseFiles;
use super::stats::CacheStats;
use crate::Result;
use crate::config::EngineConfig;
use crate::keys::DataKey;
use crate::migration::{self, MigrationOutcome, Schema};

pub(crate) struct Engine {
    id: u64,
    files: DatabaseFiles,
    pool: SqlitePool,
    key: DataKey,
    stats: Arc<CacheStats>,
    active: watch::Sender<usize>,
    next_session: AtomicU64,
}

impl Engine {
    /// Recover, decrypt, connect and migrate.
    ///
    /// On any failure after the decrypt the plaintext is removed and the
    /// ciphertext moved back, leaving the path idle.
    pub(crate) async fn create(
        id: u64,
        path: PathBuf,
        schema: Arc<Schema>,
        key: DataKey,
        config: &EngineConfig,
        stats: Arc<CacheStats>,
    ) -> Result<Self> {
        let files = DatabaseFiles::new(&path);
        let (files, key, recovery) = tokio::task::spawn_blocking(move || -> Result<_> {
            let recovery = files.recover(&key)?;
            files.open(&key)?;
            Ok((files, key, recovery))
        })
        .await
        .map_err(task_failed)??;
        stats.record_decrypt();
        if !recovery.is_clean() {
            stats.record_recovery();
            warn!(path = %path.display(), ?recovery, "Recovered database before opening");
        }

        match connect(&files, &schema, config).await {
            Ok((pool, outcome)) => {
                info!(path = %path.display(), engine = id, ?outcome, "Engine created");
                let (active, _) = watch::channel(0);
                Ok(Self {
                    id,
                    files,
                    pool,
                    key,
                    stats,
                    active,
                    next_session: AtomicU64::new(0),
                })
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Engine creation failed, restoring ciphertext");
                let restore = files.clone();
                match tokio::task::spawn_blocking(move || restore.abort_open()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(restore_err)) => {
                        error!(path = %path.display(), error = %restore_err, "Failed to restore ciphertext");
                    }
                    Err(join) => {
                        error!(path = %path.display(), error = %join, "Restore task failed");
                    }
                }
                Err(e)
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.files.plain
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Count one more active session. The count drops again when the
    /// returned registration is dropped.
    pub(crate) fn register(self: &Arc<Self>) -> Registration {
        self.active.send_modify(|n| *n += 1);
        Registration {
            engine: Arc::clone(self),
            session: self.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    pub(crate) fn active_sessions(&self) -> usize {
        *self.active.borrow()
    }

    /// Close the pool and seal the plaintext back into `P.enc`.
    ///
    /// Must only run once the engine has left the cache.
    pub(crate) async fn seal(&self) -> Result<()> {
        self.pool.close().await;
        let (files, key) = (self.files.clone(), self.key.clone());
        let sealed = tokio::task::spawn_blocking(move || files.seal(&key))
            .await
            .map_err(task_failed)
            .and_then(|sealed| sealed);
        self.stats.record_eviction();

        match sealed {
            Ok(()) => {
                self.stats.record_encrypt();
                info!(path = %self.path().display(), engine = self.id, "Engine evicted");
                Ok(())
            }
            Err(source) => {
                self.stats.record_reencrypt_failure();
                error!(
                    path = %self.path().display(),
                    engine = self.id,
                    error = %source,
                    "Re-encryption failed, previous ciphertext restored"
                );
                Err(EngineError::ReEncryptionFailed {
                    path: self.path().to_path_buf(),
                    source: Box::new(source),
                }
                .into())
            }
        }
    }

    /// Close the pool and drop the plaintext without sealing it.
    pub(crate) async fn discard(&self, wait: Duration) {
        if tokio::time::timeout(wait, self.pool.close()).await.is_err() {
            warn!(path = %self.path().display(), "Sessions still open while discarding engine");
        }
        let files = self.files.clone();
        match tokio::task::spawn_blocking(move || files.abort_open()).await {
            Ok(Ok(())) => info!(path = %self.path().display(), engine = self.id, "Engine discarded"),
            Ok(Err(e)) => error!(path = %self.path().display(), error = %e, "Failed to discard engine"),
            Err(e) => error!(path = %self.path().display(), error = %e, "Discard task failed"),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("path", &self.files.plain)
            .field("active", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

async fn connect(
    files: &DatabaseFiles,
    schema: &Schema,
    config: &EngineConfig,
) -> Result<(SqlitePool, MigrationOutcome)> {
    let options = SqliteConnectOptions::new()
        .filename(&files.plain)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(config.busy_timeout);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|source| EngineError::Sql {
            context: format!("Failed to open {}", files.plain.display()),
            source,
        })?;

    match migration::run(&pool, schema, &files.lock, config).await {
        Ok(outcome) => Ok((pool, outcome)),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

/// One counted session on an engine.
#[derive(Debug)]
pub(crate) struct Registration {
    engine: Arc<Engine>,
    session: u64,
}

impl Registration {
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.engine
            .active
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

