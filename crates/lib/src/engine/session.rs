//! Request-scoped transactional handles.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::pin::Pin;

use sqlx::{Sqlite, SqliteConnection, Transaction};

use super::errors::EngineError;
use super::live::Registration;
use crate::Result;

/// Future returned by closures passed to
/// [`EngineCache::with_session`](super::EngineCache::with_session).
pub type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 's>>;

/// One transaction on a pooled connection of a live engine.
///
/// The session counts against its engine until it is dropped, which keeps the
/// engine out of idle eviction. [`commit`](Self::commit) persists the work;
/// dropping the session in any other way rolls it back.
///
/// Derefs to [`SqliteConnection`], so queries run as
/// `sqlx::query(..).execute(&mut *session)`.
pub struct Session {
    // Declared before `registration` so the connection goes back to the pool
    // before the engine sees the session count drop.
    tx: Transaction<'static, Sqlite>,
    registration: Registration,
}

impl Session {
    pub(crate) async fn begin(registration: Registration) -> Result<Self> {
        let tx = registration
            .engine()
            .pool()
            .begin()
            .await
            .map_err(|source| EngineError::Sql {
                context: "Failed to begin session".to_string(),
                source,
            })?;
        tracing::trace!(
            engine = registration.engine().id(),
            session = registration.session(),
            "Session started"
        );
        Ok(Self { tx, registration })
    }

    /// Identifier of the engine this session belongs to.
    ///
    /// Two sessions with the same engine id share one decrypted database.
    pub fn engine_id(&self) -> u64 {
        self.registration.engine().id()
    }

    /// Sequence number of this session within its engine.
    pub fn id(&self) -> u64 {
        self.registration.session()
    }

    /// Plaintext path of the database.
    pub fn path(&self) -> &Path {
        self.registration.engine().path()
    }

    pub async fn commit(self) -> Result<()> {
        let Session { tx, registration } = self;
        tx.commit().await.map_err(|source| EngineError::Sql {
            context: "Failed to commit session".to_string(),
            source,
        })?;
        drop(registration);
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let Session { tx, registration } = self;
        tx.rollback().await.map_err(|source| EngineError::Sql {
            context: "Failed to roll back session".to_string(),
            source,
        })?;
        drop(registration);
        Ok(())
    }
}

impl Deref for Session {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine_id())
            .field("id", &self.id())
            .field("path", &self.path())
            .finish()
    }
}
