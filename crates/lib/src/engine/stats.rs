//! Counters for observing the engine cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by a cache and its engines.
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    decrypts: AtomicU64,
    encrypts: AtomicU64,
    engines_created: AtomicU64,
    evictions: AtomicU64,
    reencrypt_failures: AtomicU64,
    recoveries: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_decrypt(&self) {
        self.decrypts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encrypt(&self) {
        self.encrypts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_engine_created(&self) {
        self.engines_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reencrypt_failure(&self) {
        self.reencrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            decrypts: self.decrypts.load(Ordering::Relaxed),
            encrypts: self.encrypts.load(Ordering::Relaxed),
            engines_created: self.engines_created.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reencrypt_failures: self.reencrypt_failures.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Ciphertexts decrypted to open an engine
    pub decrypts: u64,
    /// Plaintexts sealed on eviction or DEK rotation
    pub encrypts: u64,
    /// Engines that reached the cache
    pub engines_created: u64,
    /// Engines removed from the cache after sealing
    pub evictions: u64,
    /// Evictions whose re-encryption failed and was rolled back
    pub reencrypt_failures: u64,
    /// Non-clean on-disk states repaired before opening
    pub recoveries: u64,
}
