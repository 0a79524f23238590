//! Constants used throughout the Lockbox library.
//!
//! File names and suffixes here define the on-disk layout; changing any of them
//! orphans existing user data.

use std::time::Duration;

/// Sealed keyring record, per user.
pub const KEYRING_FILE: &str = "keyring.enc";

/// Vault-wrapped keyring key, per user.
pub const KEYRING_KEY_FILE: &str = "keyring_key.enc";

/// Suffix of a sealed database file.
pub const CIPHERTEXT_SUFFIX: &str = ".enc";

/// Suffix of the last sealed copy kept while an engine is live.
pub const ROLLBACK_SUFFIX: &str = ".old";

/// Suffix of the previous version kept during a safe overwrite.
pub const PREVIOUS_SUFFIX: &str = ".prev";

/// Suffix of a ciphertext being written before it is renamed into place.
pub const STAGING_SUFFIX: &str = ".tmp";

/// Suffix of a plaintext being decrypted before it is renamed into place.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Suffix appended to a database name for its wrapped DEK.
pub const DEK_SUFFIX: &str = "_dek.enc";

/// Suffix of the cross-process migration lock.
pub const MIGRATION_LOCK_SUFFIX: &str = ".migrate.lock";

/// SQLite rollback journal suffix (no dot, SQLite appends it directly).
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Prefix of a user directory that is being removed.
pub const TOMBSTONE_PREFIX: &str = ".deleting-";

/// Default idle grace period before an engine is evicted.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(30);

/// Default time a caller waits for an engine to be created.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bearer token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
