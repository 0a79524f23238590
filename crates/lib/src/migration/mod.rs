//! Migration runner.
//!
//! A [`Schema`] describes the head state of one kind of database (the `CREATE`
//! statements a fresh database gets) plus the ordered steps that bring older
//! databases forward. The current revision is stamped in a `schema_version` table.
//!
//! # Adding a New Migration
//!
//! 1. Change the table DDL passed to [`Schema::table`] to the new head shape
//! 2. Add a [`Schema::migration`] step from the previous head to the new one
//!
//! Running [`run`] against a database already at the head does no DDL and takes no
//! lock, so it is cheap to call on every engine start.

mod errors;
mod lock;

pub use errors::MigrationError;
pub use lock::{MigrationLock, STALE_AFTER};

use std::path::Path;

use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;
use crate::config::EngineConfig;

/// Marker table holding the stamped revision.
pub const MARKER_TABLE: &str = "schema_version";

/// Extension trait for sqlx Result types to simplify error handling.
///
/// Similar to `anyhow::Context`, this trait converts sqlx errors to
/// [`MigrationError::Sql`] with a context message.
trait SqlxResultExt<T> {
    fn sql_context(self, context: &str) -> Result<T>;
}

impl<T> SqlxResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T> {
        self.map_err(|source| {
            MigrationError::Sql {
                context: context.to_string(),
                source,
            }
            .into()
        })
    }
}

/// One upgrade step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub from: i64,
    pub to: i64,
    pub statements: Vec<String>,
}

/// Declarative description of a database kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    name: String,
    tables: Vec<String>,
    migrations: Vec<Migration>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a statement run when a fresh database is created.
    pub fn table(mut self, ddl: impl Into<String>) -> Self {
        self.tables.push(ddl.into());
        self
    }

    /// Add an upgrade step from revision `from` to `to`.
    pub fn migration<I, S>(mut self, from: i64, to: i64, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.migrations.push(Migration {
            from,
            to,
            statements: statements.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The highest revision any step reaches, or 1 without steps.
    pub fn head(&self) -> i64 {
        self.migrations.iter().map(|m| m.to).max().unwrap_or(1)
    }

    /// Steps from `from` up to the head, following `from → to` links.
    fn path_from(&self, from: i64) -> Result<Vec<&Migration>> {
        let head = self.head();
        let mut steps = Vec::new();
        let mut current = from;
        while current < head {
            let step = self
                .migrations
                .iter()
                .filter(|m| m.from == current && m.to > current && m.to <= head)
                .max_by_key(|m| m.to)
                .ok_or_else(|| MigrationError::NoPath {
                    schema: self.name.clone(),
                    from: current,
                    head,
                })?;
            steps.push(step);
            current = step.to;
        }
        Ok(steps)
    }
}

/// What [`run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Empty database: created every table and stamped the head.
    Initialized { head: i64 },
    /// Already at the head.
    UpToDate { head: i64 },
    /// Applied steps from `from` to `to` in one transaction.
    Upgraded { from: i64, to: i64 },
}

/// Bring the database behind `pool` to `schema`'s head revision.
///
/// DDL only runs while holding the lock file at `lock_path`; the marker is read
/// again once the lock is held so that concurrent runners do the work once.
pub async fn run(
    pool: &SqlitePool,
    schema: &Schema,
    lock_path: &Path,
    config: &EngineConfig,
) -> Result<MigrationOutcome> {
    let head = schema.head();
    {
        let mut conn = pool.acquire().await.sql_context("acquire connection")?;
        if let Some(current) = read_marker(&mut conn).await?
            && current == head
        {
            tracing::debug!(schema = schema.name(), head, "Schema up to date");
            return Ok(MigrationOutcome::UpToDate { head });
        }
    }

    let _lock = MigrationLock::acquire(
        lock_path,
        config.migration_lock_timeout,
        config.migration_lock_retry,
    )
    .await?;

    let mut tx = pool.begin().await.sql_context("begin migration")?;
    let marker = read_marker(&mut tx).await?;
    let fresh = marker.is_none() && !has_user_tables(&mut tx).await?;
    let outcome = match marker {
        Some(current) if current == head => MigrationOutcome::UpToDate { head },
        Some(current) if current > head => {
            return Err(MigrationError::AheadOfHead {
                schema: schema.name.clone(),
                found: current,
                head,
            }
            .into());
        }
        None if fresh => {
            for statement in &schema.tables {
                execute(&mut tx, schema, statement).await?;
            }
            stamp(&mut tx, head).await?;
            MigrationOutcome::Initialized { head }
        }
        marker => {
            let from = marker.unwrap_or(0);
            tracing::info!(schema = schema.name(), from, to = head, "Starting schema migration");
            for step in schema.path_from(from)? {
                tracing::info!(schema = schema.name(), from = step.from, to = step.to, "Running migration");
                for statement in &step.statements {
                    execute(&mut tx, schema, statement).await?;
                }
            }
            stamp(&mut tx, head).await?;
            MigrationOutcome::Upgraded { from, to: head }
        }
    };
    tx.commit().await.sql_context("commit migration")?;

    tracing::debug!(schema = schema.name(), ?outcome, "Migration finished");
    Ok(outcome)
}

/// Read the stamped revision, or `None` when the database was never stamped.
pub async fn current_revision(pool: &SqlitePool) -> Result<Option<i64>> {
    let mut conn = pool.acquire().await.sql_context("acquire connection")?;
    read_marker(&mut conn).await
}

/// SHA-256 over every DDL statement in `sqlite_master`, as lowercase hex.
pub async fn schema_fingerprint(pool: &SqlitePool) -> Result<String> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT type, name, sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY type, name",
    )
    .fetch_all(pool)
    .await
    .sql_context("read sqlite_master")?;

    let mut hasher = Sha256::new();
    for (kind, name, sql) in rows {
        hasher.update(kind.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(sql.as_bytes());
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn read_marker(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let exists: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(MARKER_TABLE)
            .fetch_one(&mut *conn)
            .await
            .sql_context("look up schema_version")?;
    if exists == 0 {
        return Ok(None);
    }
    sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&mut *conn)
        .await
        .sql_context("read schema_version")
}

async fn has_user_tables(conn: &mut SqliteConnection) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?",
    )
    .bind(MARKER_TABLE)
    .fetch_one(&mut *conn)
    .await
    .sql_context("count tables")?;
    Ok(count > 0)
}

async fn stamp(conn: &mut SqliteConnection, revision: i64) -> Result<()> {
    // BIGINT for parity with other engines' marker tables
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version BIGINT PRIMARY KEY)")
        .execute(&mut *conn)
        .await
        .sql_context("create schema_version")?;
    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *conn)
        .await
        .sql_context("clear schema_version")?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(revision)
        .execute(&mut *conn)
        .await
        .sql_context("stamp schema_version")?;
    Ok(())
}

async fn execute(conn: &mut SqliteConnection, schema: &Schema, statement: &str) -> Result<()> {
    sqlx::query(statement)
        .execute(&mut *conn)
        .await
        .map_err(|source| MigrationError::Statement {
            schema: schema.name.clone(),
            statement: statement.to_string(),
            source,
        })?;
    Ok(())
}
