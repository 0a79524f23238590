//! On-disk layout of user data.
//!
//! ```text
//! <root>/<uid>/keyring.enc
//! <root>/<uid>/keyring_key.enc
//! <root>/<uid>/<service>/<db-name>.enc
//! <root>/<uid>/<service>/<db-name>_dek.enc
//! ```

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::Result;
use crate::accounts::AccountError;
use crate::constants::{
    CIPHERTEXT_SUFFIX, DEK_SUFFIX, JOURNAL_SUFFIX, KEYRING_FILE, KEYRING_KEY_FILE,
    MIGRATION_LOCK_SUFFIX, PARTIAL_SUFFIX, PREVIOUS_SUFFIX, ROLLBACK_SUFFIX, STAGING_SUFFIX,
};
use crate::keyring::ServiceNamespace;
use crate::keys::Uid;

/// Append `suffix` to the final component of `path`.
///
/// `sidecar("a/settings.db", ".old")` is `a/settings.db.old`.
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Resolves user-scoped paths below a data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn user_dir(&self, uid: &Uid) -> PathBuf {
        self.root.join(uid.as_str())
    }

    pub fn keyring(&self, uid: &Uid) -> PathBuf {
        self.user_dir(uid).join(KEYRING_FILE)
    }

    pub fn keyring_key(&self, uid: &Uid) -> PathBuf {
        self.user_dir(uid).join(KEYRING_KEY_FILE)
    }

    pub fn service_dir(&self, uid: &Uid, service: ServiceNamespace) -> PathBuf {
        self.user_dir(uid).join(service.as_str())
    }

    /// Plaintext path `P` of a database. The sealed form lives at `P.enc`.
    ///
    /// `db_name` may contain `/` to nest databases (for example
    /// `<datasource>/files.db`) but must stay below the service directory.
    pub fn database(&self, uid: &Uid, service: ServiceNamespace, db_name: &str) -> Result<PathBuf> {
        validate_db_name(db_name)?;
        Ok(self.service_dir(uid, service).join(db_name))
    }

    /// Wrapped DEK of a database: `<db-name>_dek.enc` next to the database.
    pub fn database_key(
        &self,
        uid: &Uid,
        service: ServiceNamespace,
        db_name: &str,
    ) -> Result<PathBuf> {
        let db = self.database(uid, service, db_name)?;
        Ok(sidecar(&db, DEK_SUFFIX))
    }
}

/// Endings that would make a database name collide with another database's sidecar.
const RESERVED_SUFFIXES: [&str; 8] = [
    CIPHERTEXT_SUFFIX,
    ROLLBACK_SUFFIX,
    PREVIOUS_SUFFIX,
    STAGING_SUFFIX,
    PARTIAL_SUFFIX,
    JOURNAL_SUFFIX,
    MIGRATION_LOCK_SUFFIX,
    "_dek",
];

fn validate_db_name(db_name: &str) -> Result<()> {
    let path = Path::new(db_name);
    let only_normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    let reserved = RESERVED_SUFFIXES
        .iter()
        .any(|suffix| db_name.ends_with(suffix));
    if db_name.is_empty() || !only_normal || reserved {
        return Err(AccountError::InvalidDatabaseName {
            name: db_name.to_string(),
        }
        .into());
    }
    Ok(())
}
