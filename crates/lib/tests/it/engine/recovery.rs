use std::fs;
use std::path::Path;

use lockbox::cipher;
use lockbox::{DataKey, EngineState, ErrorKind, Recovery};

use crate::helpers::*;

/// Recreate the files a crashed process leaves between decrypt and first write.
fn simulate_open(path: &Path, key: &DataKey) {
    cipher::decrypt_file(enc(path), path, key).unwrap();
    fs::rename(enc(path), old(path)).unwrap();
}

async fn assert_reopens_with(path: &Path, key: &DataKey, notes: i64) {
    let cache = setup_sticky_cache();
    assert_eq!(count_notes(&cache, path, &notes_schema(), key).await, notes);
    assert_eq!(cache.state(path), EngineState::Live { sessions: 0 });
    assert!(cache.evict(path).await.unwrap());
    assert_eq!(on_disk(path), IDLE);
}

#[tokio::test]
async fn only_ciphertext_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["a", "b"]).await;

    let cache = setup_sticky_cache();
    assert_eq!(cache.recover(&path, &key).await.unwrap(), Recovery::Clean);
    assert_eq!(cache.stats().recoveries, 0);
    assert_reopens_with(&path, &key, 2).await;
}

#[tokio::test]
async fn ciphertext_wins_over_stale_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["a", "b"]).await;
    fs::write(old(&path), b"left over from an earlier open").unwrap();

    let cache = setup_sticky_cache();
    assert_eq!(
        cache.recover(&path, &key).await.unwrap(),
        Recovery::RemovedStale
    );
    assert_eq!(on_disk(&path), IDLE);
    assert_reopens_with(&path, &key, 2).await;
}

#[tokio::test]
async fn crash_after_open_restores_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["pristine"]).await;
    let sealed = fs::read(enc(&path)).unwrap();

    simulate_open(&path, &key);
    assert_eq!(on_disk(&path), LIVE);

    let cache = setup_sticky_cache();
    assert_eq!(
        cache.recover(&path, &key).await.unwrap(),
        Recovery::RestoredRollback
    );
    assert_eq!(cache.stats().recoveries, 1);
    assert_eq!(on_disk(&path), IDLE);
    assert_eq!(fs::read(enc(&path)).unwrap(), sealed);
    assert_reopens_with(&path, &key, 1).await;
}

#[tokio::test]
async fn acquire_recovers_before_opening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["pristine"]).await;
    simulate_open(&path, &key);

    let cache = setup_sticky_cache();
    assert_eq!(count_notes(&cache, &path, &notes_schema(), &key).await, 1);
    let stats = cache.stats();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.decrypts, 1);
}

#[tokio::test]
async fn lone_plaintext_is_resealed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["only", "plaintext"]).await;
    cipher::decrypt_file(enc(&path), &path, &key).unwrap();
    fs::remove_file(enc(&path)).unwrap();

    let cache = setup_sticky_cache();
    assert_eq!(
        cache.recover(&path, &key).await.unwrap(),
        Recovery::ResealedPlaintext
    );
    assert_eq!(on_disk(&path), IDLE);
    assert_reopens_with(&path, &key, 2).await;
}

#[tokio::test]
async fn missing_database_is_initialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("notes.db");
    let key = DataKey::generate();

    let cache = setup_sticky_cache();
    assert_eq!(cache.recover(&path, &key).await.unwrap(), Recovery::Initialized);
    assert_eq!(on_disk(&path), IDLE);
    assert_eq!(cache.stats().recoveries, 0);
    assert_reopens_with(&path, &key, 0).await;
}

#[tokio::test]
async fn recover_refuses_live_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let cache = setup_sticky_cache();
    let key = DataKey::generate();

    let _session = cache.acquire(&path, &notes_schema(), &key).await.unwrap();
    let err = cache.recover(&path, &key).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(on_disk(&path), LIVE);
}

#[tokio::test]
async fn tampered_ciphertext_never_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["secret"]).await;
    flip_bit(&enc(&path), 100, 3);

    let cache = setup_sticky_cache();
    let err = cache
        .acquire(&path, &notes_schema(), &key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    assert!(err.is_invalid_key());
    assert_eq!(cache.state(&path), EngineState::Absent);
    assert!(cache.live_paths().is_empty());
    assert_eq!(on_disk(&path), IDLE);
    assert!(!sidecar(&path, ".partial").exists());

    // Retrying fails the same way rather than reusing a cached failure.
    let err = cache
        .acquire(&path, &notes_schema(), &key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    assert_eq!(cache.stats().engines_created, 0);
}

#[tokio::test]
async fn wrong_key_leaves_ciphertext_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["secret"]).await;
    let sealed = fs::read(enc(&path)).unwrap();

    let cache = setup_sticky_cache();
    let err = cache
        .acquire(&path, &notes_schema(), &DataKey::generate())
        .await
        .unwrap_err();
    assert!(err.is_invalid_key());
    assert_eq!(fs::read(enc(&path)).unwrap(), sealed);
    assert_eq!(on_disk(&path), IDLE);
}

#[tokio::test]
async fn fresh_database_rejects_another_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();

    let cache = setup_sticky_cache();
    assert_eq!(cache.recover(&path, &key).await.unwrap(), Recovery::Initialized);
    assert!(!fs::read(enc(&path)).unwrap().is_empty());

    let err = cache
        .acquire(&path, &notes_schema(), &DataKey::generate())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    assert_eq!(on_disk(&path), IDLE);
}

#[tokio::test]
async fn emptied_ciphertext_does_not_open_as_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let key = DataKey::generate();
    sealed_notes_db(&path, &key, &["secret"]).await;
    fs::write(enc(&path), b"").unwrap();

    let cache = setup_sticky_cache();
    let err = cache
        .acquire(&path, &notes_schema(), &key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    assert_eq!(cache.stats().engines_created, 0);
}
