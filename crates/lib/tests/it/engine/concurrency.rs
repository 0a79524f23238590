use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lockbox::{DataKey, EngineCache, EngineState, ErrorKind};

use crate::helpers::*;

/// Seal a notes database of roughly 10 MiB at `path`.
async fn sealed_large_db(path: &Path, key: &DataKey) {
    let cache = setup_sticky_cache();
    let schema = notes_schema();
    cache
        .with_session(path, &schema, key, |s| {
            Box::pin(async move {
                sqlx::query(
                    "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 5000) \
                     INSERT INTO notes (body) SELECT hex(randomblob(1024)) FROM n",
                )
                .execute(&mut **s)
                .await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    assert!(cache.evict(path).await.unwrap());
    assert!(std::fs::metadata(enc(path)).unwrap().len() >= 10 * 1024 * 1024);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_share_one_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_large_db(&path, &key).await;

    let cache = setup_sticky_cache();
    let schema = notes_schema();
    let before = cache.stats();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let (cache, path, schema, key) =
                (cache.clone(), path.clone(), Arc::clone(&schema), key.clone());
            tokio::spawn(async move {
                let session = cache.acquire(&path, &schema, &key).await.unwrap();
                session.engine_id()
            })
        })
        .collect();

    let mut engine_ids = Vec::new();
    for task in tasks {
        engine_ids.push(task.await.unwrap());
    }
    engine_ids.dedup();
    assert_eq!(engine_ids.len(), 1, "sessions bound to different engines");

    let after = cache.stats();
    assert_eq!(after.decrypts - before.decrypts, 1);
    assert_eq!(after.engines_created, 1);
    assert_eq!(cache.state(&path), EngineState::Live { sessions: 0 });
    assert_eq!(cache.live_paths(), vec![path.clone()]);
    assert_eq!(on_disk(&path), LIVE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creation_outlives_a_timed_out_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_large_db(&path, &key).await;

    let cache = EngineCache::new(
        test_config(Duration::from_secs(600)).with_creation_timeout(Duration::from_micros(1)),
    );
    let err = cache
        .acquire(&path, &notes_schema(), &key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineCreationTimeout);

    // The engine still arrives and is kept.
    assert!(
        wait_until(SETTLE, || cache.state(&path) == EngineState::Live { sessions: 0 }).await
    );
    assert_eq!(cache.stats().engines_created, 1);
    assert_eq!(on_disk(&path), LIVE);
}

#[tokio::test]
async fn distinct_paths_get_distinct_engines() {
    let dir = tempfile::tempdir().unwrap();
    let cache = setup_sticky_cache();
    let (notes, settings) = (notes_schema(), settings_schema());
    let key = DataKey::generate();

    let a = cache
        .acquire(dir.path().join("a.db"), &notes, &key)
        .await
        .unwrap();
    let b = cache
        .acquire(dir.path().join("b.db"), &settings, &key)
        .await
        .unwrap();
    assert_ne!(a.engine_id(), b.engine_id());
    drop((a, b));

    assert_eq!(cache.shutdown().await.unwrap(), 2);
    assert!(cache.live_paths().is_empty());
    assert_eq!(on_disk(&dir.path().join("a.db")), IDLE);
    assert_eq!(on_disk(&dir.path().join("b.db")), IDLE);
}

#[tokio::test]
async fn shutdown_seals_engine_still_being_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_large_db(&path, &key).await;

    let cache = setup_sticky_cache();
    let acquirer = {
        let (cache, path, key) = (cache.clone(), path.clone(), key.clone());
        tokio::spawn(async move { cache.acquire(&path, &notes_schema(), &key).await.map(drop) })
    };
    while cache.state(&path) == EngineState::Absent {
        tokio::task::yield_now().await;
    }
    assert_eq!(cache.state(&path), EngineState::Creating);

    assert_eq!(cache.shutdown().await.unwrap(), 1);
    assert_eq!(cache.state(&path), EngineState::Absent);
    assert_eq!(on_disk(&path), IDLE);

    // The acquirer either got its session before the seal or was turned away.
    if let Err(e) = acquirer.await.unwrap() {
        assert!(e.is_transient(), "{e}");
    }
    // Engines open again once shutdown has returned.
    assert_eq!(count_notes(&cache, &path, &notes_schema(), &key).await, 5000);
}
