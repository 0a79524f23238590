//! Migration runner against pools and through the engine cache.

use std::sync::Arc;

use lockbox::migration::{self, current_revision, schema_fingerprint};
use lockbox::{DataKey, EngineConfig, ErrorKind, MigrationOutcome, Schema};
use sqlx::sqlite::SqlitePoolOptions;

use crate::helpers::*;

fn schema_v1() -> Schema {
    Schema::new("notes").table("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
}

fn schema_v2() -> Schema {
    Schema::new("notes")
        .table(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, pinned INTEGER NOT NULL DEFAULT 0)",
        )
        .migration(
            1,
            2,
            ["ALTER TABLE notes ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0"],
        )
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let lock = dir.path().join("db.migrate.lock");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let config = EngineConfig::default();
    let schema = schema_v2();

    let first = migration::run(&pool, &schema, &lock, &config).await.unwrap();
    assert_eq!(first, MigrationOutcome::Initialized { head: 2 });
    let fingerprint = schema_fingerprint(&pool).await.unwrap();

    let second = migration::run(&pool, &schema, &lock, &config).await.unwrap();
    assert_eq!(second, MigrationOutcome::UpToDate { head: 2 });
    assert_eq!(schema_fingerprint(&pool).await.unwrap(), fingerprint);
    assert_eq!(current_revision(&pool).await.unwrap(), Some(2));
    assert!(!lock.exists());
}

#[tokio::test]
async fn reopened_database_is_upgraded_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["kept"]).await;

    let cache = setup_sticky_cache();
    let v2 = Arc::new(schema_v2());
    let mut session = cache.acquire(&path, &v2, &key).await.unwrap();
    let (body, pinned): (String, i64) = sqlx::query_as("SELECT body, pinned FROM notes")
        .fetch_one(&mut *session)
        .await
        .unwrap();
    assert_eq!((body.as_str(), pinned), ("kept", 0));
    let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_one(&mut *session)
        .await
        .unwrap();
    assert_eq!(version, 2);
}

#[tokio::test]
async fn database_ahead_of_head_fails_and_stays_sealed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();

    let cache = setup_sticky_cache();
    let v2 = Arc::new(schema_v2());
    drop(cache.acquire(&path, &v2, &key).await.unwrap());
    cache.evict(&path).await.unwrap();

    let v1 = Arc::new(schema_v1());
    let err = cache.acquire(&path, &v1, &key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationFailure);
    assert_eq!(on_disk(&path), IDLE);
    assert_eq!(cache.state(&path), lockbox::EngineState::Absent);
}

#[tokio::test]
async fn missing_migration_step_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &[]).await;

    // Head 3 with no step out of revision 1.
    let broken = Arc::new(schema_v1().migration(2, 3, ["SELECT 1"]));
    let cache = setup_sticky_cache();
    let err = cache.acquire(&path, &broken, &key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationFailure);
    assert_eq!(on_disk(&path), IDLE);
}

#[tokio::test]
async fn held_lock_times_out_as_transient() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &[]).await;
    std::fs::write(sidecar(&path, ".migrate.lock"), b"4242\n").unwrap();

    let cache = lockbox::EngineCache::new(test_config(GRACE).with_migration_lock(
        std::time::Duration::from_millis(100),
        std::time::Duration::from_millis(10),
    ));
    let err = cache
        .acquire(&path, &Arc::new(schema_v2()), &key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(on_disk(&path), IDLE);
}
