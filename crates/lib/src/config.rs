//! Runtime configuration.
//!
//! [`EngineConfig`] tunes the engine cache, [`Deployment`] selects where user data
//! lives and [`LockboxConfig`] bundles both with the token settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_BUSY_TIMEOUT, DEFAULT_CREATION_TIMEOUT, DEFAULT_IDLE_GRACE, DEFAULT_TOKEN_TTL,
};

/// Tuning knobs for the engine cache and the migration runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Time without sessions before an engine is sealed and evicted.
    pub idle_grace: Duration,
    /// How long an acquirer waits for an engine to be created.
    pub creation_timeout: Duration,
    /// SQLite busy timeout for every pooled connection.
    pub busy_timeout: Duration,
    /// Maximum pooled connections per engine.
    pub max_connections: u32,
    /// How long the migration runner waits for the cross-process lock.
    pub migration_lock_timeout: Duration,
    /// Interval between attempts to take the migration lock.
    pub migration_lock_retry: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_grace: DEFAULT_IDLE_GRACE,
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_connections: 5,
            migration_lock_timeout: DEFAULT_CREATION_TIMEOUT,
            migration_lock_retry: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Clamped to at least one connection.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_migration_lock(mut self, timeout: Duration, retry: Duration) -> Self {
        self.migration_lock_timeout = timeout;
        self.migration_lock_retry = retry;
        self
    }
}

/// Where per-user directories live.
///
/// Self-hosted installs keep everything below one data directory and create user
/// directories on registration. Hosted installs get one externally mounted volume
/// per user below `mount_root`; the mount must already be present when a user's
/// data is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    SelfHosted { data_dir: PathBuf },
    Hosted { mount_root: PathBuf },
}

impl Deployment {
    /// The effective filesystem root holding `<uid>/` directories.
    pub fn data_root(&self) -> &Path {
        match self {
            Deployment::SelfHosted { data_dir } => data_dir,
            Deployment::Hosted { mount_root } => mount_root,
        }
    }

    /// Whether missing user directories may be created by this process.
    pub fn provisions_user_dirs(&self) -> bool {
        matches!(self, Deployment::SelfHosted { .. })
    }
}

/// Everything needed to build an [`Accounts`](crate::Accounts) facade.
#[derive(Clone)]
pub struct LockboxConfig {
    pub deployment: Deployment,
    pub engine: EngineConfig,
    /// HMAC secret used to sign bearer tokens.
    pub token_secret: Zeroizing<Vec<u8>>,
    pub token_ttl: Duration,
}

impl LockboxConfig {
    pub fn new(deployment: Deployment, token_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            deployment,
            engine: EngineConfig::default(),
            token_secret: Zeroizing::new(token_secret.into()),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }
}

impl std::fmt::Debug for LockboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockboxConfig")
            .field("deployment", &self.deployment)
            .field("engine", &self.engine)
            .field("token_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}
