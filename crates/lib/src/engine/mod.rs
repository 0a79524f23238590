//! Engine cache.
//!
//! An [`EngineCache`] keeps at most one live engine per database path. The first
//! acquirer of an idle path spawns a creation task (recover, decrypt, connect,
//! migrate) and every concurrent acquirer waits on that task's outcome. Engines
//! hand out [`Session`]s and are sealed again once no session has been active
//! for the configured grace period.
//!
//! Per path, the cache moves through:
//!
//! ```text
//! Absent -> Creating -> Live(n) -> Evicting -> Absent
//!              |                      |
//!              +----> Absent <--------+   (creation or re-encryption failed)
//! ```
//!
//! Transitions into and out of `Live` happen under a per-path async lock, so a
//! session is never registered on an engine that is being evicted.

mod errors;
mod files;
mod live;
mod session;
mod stats;
mod watcher;

pub use errors::EngineError;
pub use files::Recovery;
pub use session::{Session, SessionFuture};
pub use stats::StatsSnapshot;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use handle_trait::Handle;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{Instrument, info_span};

pub(crate) use errors::task_failed;
use files::DatabaseFiles;
use live::{Engine, Registration};
use stats::CacheStats;

use crate::config::EngineConfig;
use crate::keys::DataKey;
use crate::migration::Schema;
use crate::{Error, Result};

/// Observable state of one database path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No engine; only ciphertext on disk.
    Absent,
    /// A creation task is running.
    Creating,
    /// An engine is cached with this many active sessions.
    Live { sessions: usize },
    /// The engine left the cache and is being sealed.
    Evicting,
}

type Outcome = Option<std::result::Result<Arc<Engine>, Arc<Error>>>;

/// Result of an eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eviction {
    Evicted,
    NotCached,
    Active,
}

#[derive(Default)]
struct CacheState {
    engines: HashMap<PathBuf, Arc<Engine>>,
    pending: HashMap<PathBuf, watch::Receiver<Outcome>>,
    evicting: HashSet<PathBuf>,
    locks: HashMap<PathBuf, Arc<AsyncMutex<()>>>,
    /// Running `shutdown` calls; while non-zero no creation is started.
    closing: usize,
}

pub(crate) struct CacheInner {
    config: EngineConfig,
    state: Mutex<CacheState>,
    stats: Arc<CacheStats>,
    next_engine_id: AtomicU64,
}

/// Shared cache of live engines.
///
/// Cloning is cheap; all clones share one cache. Create one at the application
/// entry point and pass it to request handlers. Tests build their own.
#[derive(Clone, Debug, Handle)]
pub struct EngineCache {
    inner: Arc<CacheInner>,
}

impl EngineCache {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState::default()),
                stats: Arc::new(CacheStats::default()),
                next_engine_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Lend a session on the database at `path`, creating its engine if needed.
    ///
    /// `path` names the plaintext database; its ciphertext lives at `path.enc`.
    /// Waiting for the engine is bounded by the creation timeout; on timeout the
    /// creation task keeps running and the error is
    /// [`EngineError::CreationTimeout`]. Dropping the returned future only
    /// abandons the wait.
    pub async fn acquire(
        &self,
        path: impl AsRef<Path>,
        schema: &Arc<Schema>,
        key: &DataKey,
    ) -> Result<Session> {
        let path = path.as_ref();
        let timeout = self.inner.config.creation_timeout;
        async {
            let registration =
                tokio::time::timeout(timeout, CacheInner::register(&self.inner, path, schema, key))
                    .await
                    .map_err(|_| EngineError::CreationTimeout {
                        path: path.to_path_buf(),
                        timeout,
                    })??;
            Session::begin(registration).await
        }
        .instrument(info_span!("acquire", path = %path.display()))
        .await
    }

    /// Run `f` inside a session, committing on `Ok` and rolling back on `Err`.
    ///
    /// ```ignore
    /// cache
    ///     .with_session(&path, &schema, &key, |session| {
    ///         Box::pin(async move {
    ///             sqlx::query("INSERT INTO notes (body) VALUES ('hi')")
    ///                 .execute(&mut **session)
    ///                 .await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_session<T, F>(
        &self,
        path: impl AsRef<Path>,
        schema: &Arc<Schema>,
        key: &DataKey,
        f: F,
    ) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> SessionFuture<'s, T>,
    {
        let mut session = self.acquire(path, schema, key).await?;
        match f(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed session also failed");
                }
                Err(e)
            }
        }
    }

    /// Evict the engine for `path` now instead of after the grace period.
    ///
    /// Returns `false` if no engine was cached. Fails with
    /// [`EngineError::Busy`] while sessions are active.
    pub async fn evict(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let Some(engine) = self.inner.lock_state().engines.get(path).cloned() else {
            return Ok(false);
        };
        match CacheInner::evict_if_idle(&self.inner, &engine).await? {
            Eviction::Evicted => Ok(true),
            Eviction::NotCached => Ok(false),
            Eviction::Active => Err(EngineError::Busy {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }

    /// Evict every engine, waiting up to the creation timeout for each one's
    /// sessions to finish.
    ///
    /// Creations already running are waited for first, so their engines are
    /// sealed too. Until this returns, acquires that would start a new engine
    /// fail with [`EngineError::ShuttingDown`].
    ///
    /// Returns the number of engines sealed. Every engine is attempted; the first
    /// error is returned after the rest have been processed.
    pub async fn shutdown(&self) -> Result<usize> {
        let _closing = Closing::start(&self.inner);
        let timeout = self.inner.config.creation_timeout;
        let mut first_error: Option<Error> = None;

        let creating: Vec<(PathBuf, watch::Receiver<Outcome>)> = self
            .inner
            .lock_state()
            .pending
            .iter()
            .map(|(path, outcome)| (path.clone(), outcome.clone()))
            .collect();
        for (path, mut outcome) in creating {
            if tokio::time::timeout(timeout, outcome.wait_for(Option::is_some))
                .await
                .is_err()
            {
                tracing::warn!(path = %path.display(), "Engine creation still running at shutdown");
                first_error.get_or_insert_with(|| EngineError::CreationTimeout { path, timeout }.into());
            }
        }

        let engines: Vec<Arc<Engine>> = self.inner.lock_state().engines.values().cloned().collect();
        tracing::info!(engines = engines.len(), "Shutting down engine cache");

        let mut evicted = 0;
        for engine in engines {
            let mut active = engine.subscribe();
            if tokio::time::timeout(timeout, watcher::idle(&mut active))
                .await
                .is_err()
            {
                tracing::warn!(path = %engine.path().display(), "Sessions still active at shutdown");
            }
            match CacheInner::evict_if_idle(&self.inner, &engine).await {
                Ok(Eviction::Evicted) => evicted += 1,
                Ok(Eviction::NotCached) => {}
                Ok(Eviction::Active) => {
                    first_error.get_or_insert_with(|| {
                        EngineError::Busy {
                            path: engine.path().to_path_buf(),
                        }
                        .into()
                    });
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(evicted), Err)
    }

    /// Drop every engine below `prefix` without sealing it.
    ///
    /// The plaintext is removed and the ciphertext from before the engine opened
    /// is put back. Used before deleting a user's data.
    pub async fn discard_under(&self, prefix: impl AsRef<Path>) -> usize {
        let prefix = prefix.as_ref();
        let victims: Vec<Arc<Engine>> = self
            .inner
            .lock_state()
            .engines
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, engine)| Arc::clone(engine))
            .collect();

        let mut discarded = 0;
        for engine in victims {
            let lock = self.inner.path_lock(engine.path());
            let _guard = lock.lock().await;
            let removed = {
                let mut state = self.inner.lock_state();
                match state.engines.get(engine.path()) {
                    Some(current) if Arc::ptr_eq(current, &engine) => {
                        state.engines.remove(engine.path());
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                engine.discard(self.inner.config.creation_timeout).await;
                discarded += 1;
            }
        }
        discarded
    }

    /// Re-encrypt the idle database at `path` from `old` to `new`.
    ///
    /// Fails with [`EngineError::Busy`] if the path has a live or pending engine.
    /// The caller persists `new` only after this returns `Ok`.
    pub async fn rotate_dek(
        &self,
        path: impl AsRef<Path>,
        old: &DataKey,
        new: &DataKey,
    ) -> Result<()> {
        let path = path.as_ref();
        let lock = self.inner.path_lock(path);
        let _guard = lock.lock().await;
        self.inner.ensure_idle(path)?;

        let files = DatabaseFiles::new(path);
        let (old, new) = (old.clone(), new.clone());
        tokio::task::spawn_blocking(move || {
            files.recover(&old)?;
            files.rekey(&old, &new)
        })
        .await
        .map_err(task_failed)??;

        self.inner.stats.record_encrypt();
        tracing::info!(path = %path.display(), "Rotated database key");
        Ok(())
    }

    /// Run crash recovery on an idle path without opening it.
    pub async fn recover(&self, path: impl AsRef<Path>, key: &DataKey) -> Result<Recovery> {
        let path = path.as_ref();
        let lock = self.inner.path_lock(path);
        let _guard = lock.lock().await;
        self.inner.ensure_idle(path)?;

        let files = DatabaseFiles::new(path);
        let key = key.clone();
        let recovery = tokio::task::spawn_blocking(move || files.recover(&key))
            .await
            .map_err(task_failed)??;
        if !recovery.is_clean() {
            self.inner.stats.record_recovery();
        }
        Ok(recovery)
    }

    pub fn state(&self, path: impl AsRef<Path>) -> EngineState {
        let path = path.as_ref();
        let state = self.inner.lock_state();
        if state.evicting.contains(path) {
            EngineState::Evicting
        } else if let Some(engine) = state.engines.get(path) {
            EngineState::Live {
                sessions: engine.active_sessions(),
            }
        } else if state.pending.contains_key(path) {
            EngineState::Creating
        } else {
            EngineState::Absent
        }
    }

    /// Paths with a cached engine.
    pub fn live_paths(&self) -> Vec<PathBuf> {
        self.inner.lock_state().engines.keys().cloned().collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_lock(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.lock_state()
                .locks
                .entry(path.to_path_buf())
                .or_default(),
        )
    }

    fn ensure_idle(&self, path: &Path) -> Result<()> {
        let state = self.lock_state();
        if state.engines.contains_key(path) || state.pending.contains_key(path) {
            return Err(EngineError::Busy {
                path: path.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    /// Register a session on the engine for `path`, creating it if needed.
    async fn register(
        this: &Arc<Self>,
        path: &Path,
        schema: &Arc<Schema>,
        key: &DataKey,
    ) -> Result<Registration> {
        loop {
            let mut outcome = {
                let lock = this.path_lock(path);
                let _guard = lock.lock().await;
                let mut state = this.lock_state();
                if let Some(engine) = state.engines.get(path) {
                    return Ok(engine.register());
                }
                match state.pending.get(path) {
                    Some(pending) => pending.clone(),
                    None if state.closing > 0 => {
                        return Err(EngineError::ShuttingDown {
                            path: path.to_path_buf(),
                        }
                        .into());
                    }
                    None => Self::spawn_creation(this, &mut state, path, schema, key),
                }
            };

            let finished = match outcome.wait_for(Option::is_some).await {
                Ok(done) => done
                    .as_ref()
                    .map(|created| created.as_ref().map(|_| ()).map_err(Arc::clone)),
                Err(_) => None,
            };
            match finished {
                Some(Ok(())) => continue,
                Some(Err(source)) => {
                    return Err(EngineError::CreationFailed {
                        path: path.to_path_buf(),
                        source,
                    }
                    .into());
                }
                None => {
                    let mut state = this.lock_state();
                    if state
                        .pending
                        .get(path)
                        .is_some_and(|pending| pending.same_channel(&outcome))
                    {
                        state.pending.remove(path);
                    }
                    return Err(EngineError::TaskFailed {
                        reason: "engine creation task ended without a result".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Mark `path` pending and start the task that creates its engine.
    fn spawn_creation(
        this: &Arc<Self>,
        state: &mut CacheState,
        path: &Path,
        schema: &Arc<Schema>,
        key: &DataKey,
    ) -> watch::Receiver<Outcome> {
        let (done, outcome) = watch::channel(None);
        state.pending.insert(path.to_path_buf(), outcome.clone());

        let id = this.next_engine_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(this);
        let path = path.to_path_buf();
        let schema = Arc::clone(schema);
        let key = key.clone();
        let span = info_span!("create_engine", engine = id, path = %path.display());

        tokio::spawn(
            async move {
                let created = Engine::create(
                    id,
                    path.clone(),
                    schema,
                    key,
                    &inner.config,
                    Arc::clone(&inner.stats),
                )
                .await;

                let lock = inner.path_lock(&path);
                let _guard = lock.lock().await;
                let result = match created {
                    Ok(engine) => {
                        let engine = Arc::new(engine);
                        {
                            let mut state = inner.lock_state();
                            state.pending.remove(&path);
                            state.engines.insert(path.clone(), Arc::clone(&engine));
                        }
                        inner.stats.record_engine_created();
                        watcher::spawn(
                            Arc::downgrade(&inner),
                            Arc::clone(&engine),
                            inner.config.idle_grace,
                        );
                        Ok(engine)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Engine creation failed");
                        inner.lock_state().pending.remove(&path);
                        Err(Arc::new(e))
                    }
                };
                done.send_replace(Some(result));
            }
            .instrument(span),
        );
        outcome
    }

    /// Remove `engine` from the cache and seal it, if it is still cached and idle.
    ///
    /// Holds the path lock for the whole eviction so no acquirer can register on
    /// the engine or start a new one for the same path meanwhile.
    pub(crate) async fn evict_if_idle(this: &Arc<Self>, engine: &Arc<Engine>) -> Result<Eviction> {
        let path = engine.path();
        let lock = this.path_lock(path);
        let _guard = lock.lock().await;
        {
            let mut state = this.lock_state();
            match state.engines.get(path) {
                Some(current) if Arc::ptr_eq(current, engine) => {}
                _ => return Ok(Eviction::NotCached),
            }
            if engine.active_sessions() > 0 {
                return Ok(Eviction::Active);
            }
            state.engines.remove(path);
            state.evicting.insert(path.to_path_buf());
        }

        let sealed = engine
            .seal()
            .instrument(info_span!("evict", engine = engine.id(), path = %path.display()))
            .await;
        this.lock_state().evicting.remove(path);
        sealed.map(|()| Eviction::Evicted)
    }
}

/// Marks the cache as shutting down for as long as it is held.
struct Closing<'a>(&'a CacheInner);

impl<'a> Closing<'a> {
    fn start(inner: &'a CacheInner) -> Self {
        inner.lock_state().closing += 1;
        Self(inner)
    }
}

impl Drop for Closing<'_> {
    fn drop(&mut self) {
        self.0.lock_state().closing -= 1;
    }
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CacheInner")
            .field("config", &self.config)
            .field("engines", &state.engines.len())
            .field("pending", &state.pending.len())
            .field("evicting", &state.evicting.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
