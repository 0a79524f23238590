//! Shared fixtures for the integration suite.
//!
//! Grace periods are scaled down to a few hundred milliseconds; `wait_until`
//! polls for the asynchronous outcomes that follow them.

#![allow(dead_code)]

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lockbox::{
    Accounts, DataKey, Deployment, EngineCache, EngineConfig, FixedClock, LockboxConfig, Schema,
};
use tempfile::TempDir;

// Re-export tokio test macro for convenience
pub use tokio;

/// Idle grace used by eviction tests.
pub const GRACE: Duration = Duration::from_millis(200);

/// Upper bound for anything that should follow a grace period.
pub const SETTLE: Duration = Duration::from_secs(5);

// ===== CONFIG AND CACHE =====

pub fn test_config(grace: Duration) -> EngineConfig {
    EngineConfig::default()
        .with_idle_grace(grace)
        .with_creation_timeout(Duration::from_secs(30))
}

pub fn setup_cache(grace: Duration) -> EngineCache {
    EngineCache::new(test_config(grace))
}

/// A cache whose engines effectively never go idle during a test.
pub fn setup_sticky_cache() -> EngineCache {
    setup_cache(Duration::from_secs(600))
}

// ===== ACCOUNTS =====

pub struct TestAccounts {
    pub dir: TempDir,
    pub accounts: Accounts,
    pub clock: Arc<FixedClock>,
}

impl TestAccounts {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

pub fn setup_accounts(grace: Duration) -> TestAccounts {
    let dir = tempfile::tempdir().unwrap();
    let deployment = Deployment::SelfHosted {
        data_dir: dir.path().to_path_buf(),
    };
    build_accounts(dir, deployment, grace)
}

pub fn setup_hosted_accounts(grace: Duration) -> TestAccounts {
    let dir = tempfile::tempdir().unwrap();
    let deployment = Deployment::Hosted {
        mount_root: dir.path().to_path_buf(),
    };
    build_accounts(dir, deployment, grace)
}

fn build_accounts(dir: TempDir, deployment: Deployment, grace: Duration) -> TestAccounts {
    let clock = Arc::new(FixedClock::default());
    let config = LockboxConfig::new(deployment, b"integration-secret".to_vec())
        .with_engine(test_config(grace))
        .with_token_ttl(Duration::from_secs(3600));
    let accounts = Accounts::with_clock(config, clock.clone());
    TestAccounts {
        dir,
        accounts,
        clock,
    }
}

// ===== SCHEMAS =====

pub fn notes_schema() -> Arc<Schema> {
    Arc::new(
        Schema::new("notes")
            .table("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)"),
    )
}

pub fn settings_schema() -> Arc<Schema> {
    Arc::new(
        Schema::new("settings")
            .table("CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)"),
    )
}

// ===== DATABASE CONTENT =====

pub async fn insert_note(
    cache: &EngineCache,
    path: &Path,
    schema: &Arc<Schema>,
    key: &DataKey,
    body: &str,
) {
    let body = body.to_string();
    cache
        .with_session(path, schema, key, |s| {
            Box::pin(async move {
                sqlx::query("INSERT INTO notes (body) VALUES (?)")
                    .bind(body)
                    .execute(&mut **s)
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();
}

pub async fn count_notes(
    cache: &EngineCache,
    path: &Path,
    schema: &Arc<Schema>,
    key: &DataKey,
) -> i64 {
    let mut session = cache.acquire(path, schema, key).await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notes")
        .fetch_one(&mut *session)
        .await
        .unwrap();
    count
}

/// Create an idle, sealed notes database holding `bodies`.
pub async fn sealed_notes_db(path: &Path, key: &DataKey, bodies: &[&str]) {
    let cache = setup_sticky_cache();
    let schema = notes_schema();
    for body in bodies {
        insert_note(&cache, path, &schema, key, body).await;
    }
    if bodies.is_empty() {
        drop(cache.acquire(path, &schema, key).await.unwrap());
    }
    assert!(cache.evict(path).await.unwrap());
}

// ===== FILES ON DISK =====

pub fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub fn enc(path: &Path) -> PathBuf {
    sidecar(path, ".enc")
}

pub fn old(path: &Path) -> PathBuf {
    sidecar(path, ".old")
}

/// Which of `P`, `P.enc` and `P.old` exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDisk {
    pub plain: bool,
    pub sealed: bool,
    pub rollback: bool,
}

pub const IDLE: OnDisk = OnDisk {
    plain: false,
    sealed: true,
    rollback: false,
};

pub const LIVE: OnDisk = OnDisk {
    plain: true,
    sealed: false,
    rollback: true,
};

pub fn on_disk(path: &Path) -> OnDisk {
    OnDisk {
        plain: path.exists(),
        sealed: enc(path).exists(),
        rollback: old(path).exists(),
    }
}

/// Flip one bit of the file at `path`.
pub fn flip_bit(path: &Path, offset: usize, bit: u8) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset] ^= 1 << bit;
    fs::write(path, bytes).unwrap();
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
