//! Account facade.
//!
//! [`Accounts`] is what request handlers hold. It turns credentials into bearer
//! tokens, tokens into [`Keyring`]s, and keyrings into sessions on a user's
//! databases, creating each database's DEK on first use.
//!
//! Password hashing and key derivation are deliberately slow, so they run on the
//! blocking pool together with the file work around them.

mod errors;

pub use errors::AccountError;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use handle_trait::Handle;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{self, remove_if_present};
use crate::clock::{Clock, SystemClock};
use crate::config::{Deployment, LockboxConfig};
use crate::constants::{
    CIPHERTEXT_SUFFIX, DEK_SUFFIX, KEYRING_KEY_FILE, PREVIOUS_SUFFIX, ROLLBACK_SUFFIX,
    TOMBSTONE_PREFIX,
};
use crate::engine::{EngineCache, Recovery, Session, task_failed};
use crate::keyring::{Keyring, KeyringStore, ServiceNamespace};
use crate::keys::{DataKey, Uid, WrappingKey};
use crate::migration::Schema;
use crate::paths::{DataRoot, sidecar};
use crate::token::{IssuedToken, TokenIssuer};
use crate::vault::{self, Overwrite, StagedFile, VaultError};
use crate::Result;

/// A database that has a DEK on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRef {
    pub service: ServiceNamespace,
    /// Name relative to the service directory
    pub name: String,
    /// Plaintext path; the ciphertext is this path plus `.enc`
    pub path: PathBuf,
}

/// Entry point for request handlers.
///
/// Cloning is cheap; every clone shares one engine cache.
#[derive(Clone, Debug, Handle)]
pub struct Accounts {
    inner: Arc<AccountsInner>,
}

#[derive(Debug)]
struct AccountsInner {
    deployment: Deployment,
    root: DataRoot,
    keyrings: KeyringStore,
    cache: EngineCache,
    tokens: TokenIssuer,
    /// Serialises key-file changes per user.
    users: Mutex<HashMap<Uid, Arc<AsyncMutex<()>>>>,
}

impl Accounts {
    pub fn new(config: LockboxConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a facade whose tokens are issued and checked against `clock`.
    pub fn with_clock(config: LockboxConfig, clock: Arc<dyn Clock>) -> Self {
        let root = DataRoot::new(config.deployment.data_root());
        Self {
            inner: Arc::new(AccountsInner {
                keyrings: KeyringStore::new(root.clone()),
                cache: EngineCache::new(config.engine.clone()),
                tokens: TokenIssuer::new(&config.token_secret, config.token_ttl, clock),
                deployment: config.deployment,
                root,
                users: Mutex::default(),
            }),
        }
    }

    pub fn cache(&self) -> &EngineCache {
        &self.inner.cache
    }

    pub fn root(&self) -> &DataRoot {
        &self.inner.root
    }

    /// Create the account for `email` and return its first token.
    ///
    /// Self-hosted deployments create the user directory; hosted deployments
    /// expect it to be mounted already.
    pub async fn register(&self, email: &str, secret: &str) -> Result<IssuedToken> {
        let uid = Uid::from_email(email);
        async {
            let _user = self.lock_user(&uid).await;
            if self.inner.keyrings.exists(&uid) {
                return Err(AccountError::UserExists { uid: uid.clone() }.into());
            }
            let dir = self.inner.root.user_dir(&uid);
            let provision = self.inner.deployment.provisions_user_dirs();
            if !provision && !dir.is_dir() {
                return Err(AccountError::StorageUnavailable { path: dir }.into());
            }

            let keyrings = self.inner.keyrings.clone();
            let secret = Zeroizing::new(secret.to_owned());
            let owner = uid.clone();
            let (_, keyring_key) = blocking(move || {
                if provision {
                    fs::create_dir_all(&dir)?;
                }
                let login_kek = vault::derive_kek(secret.as_bytes());
                keyrings.create(&owner, &login_kek)
            })
            .await?;

            info!("Registered user");
            self.inner.tokens.issue(&uid, &keyring_key)
        }
        .instrument(info_span!("register", %uid))
        .await
    }

    /// Check `secret`, rotate the keyring key and return a token carrying the new one.
    ///
    /// Tokens issued before this login stop opening the keyring.
    pub async fn login(&self, email: &str, secret: &str) -> Result<IssuedToken> {
        self.login_inner(email, secret, |_| Ok(())).await
    }

    /// [`Accounts::login`] with a check that runs inside the keyring rotation,
    /// while both new files are in place and the previous pair is still parked.
    #[cfg(any(test, feature = "testing"))]
    pub async fn login_with_check<F>(
        &self,
        email: &str,
        secret: &str,
        check: F,
    ) -> Result<IssuedToken>
    where
        F: FnOnce(&Path) -> Result<()> + Send + 'static,
    {
        self.login_inner(email, secret, check).await
    }

    async fn login_inner<F>(&self, email: &str, secret: &str, check: F) -> Result<IssuedToken>
    where
        F: FnOnce(&Path) -> Result<()> + Send + 'static,
    {
        let uid = Uid::from_email(email);
        async {
            let _user = self.lock_user(&uid).await;
            self.user_dir(&uid)?;
            if !self.inner.keyrings.exists(&uid) {
                return Err(AccountError::UserNotFound { uid: uid.clone() }.into());
            }

            let keyrings = self.inner.keyrings.clone();
            let secret = Zeroizing::new(secret.to_owned());
            let owner = uid.clone();
            let (_, keyring_key) = blocking(move || {
                let login_kek = vault::derive_kek(secret.as_bytes());
                keyrings.rotate_checked(&owner, &login_kek, check)
            })
            .await?;

            info!("User logged in");
            self.inner.tokens.issue(&uid, &keyring_key)
        }
        .instrument(info_span!("login", %uid))
        .await
    }

    /// Verify a bearer token and open the keyring it carries the key for.
    ///
    /// Waits for a login of the same user that is rotating the keyring, so a
    /// token is judged against a settled pair of key files.
    pub async fn authenticate(&self, token: &str) -> Result<Keyring> {
        let grant = self.inner.tokens.verify(token)?;
        self.user_dir(&grant.uid)?;
        let _user = self.lock_user(&grant.uid).await;
        let keyrings = self.inner.keyrings.clone();
        blocking(move || keyrings.open(&grant.uid, &grant.keyring_key)).await
    }

    /// Load the DEK of a database, generating and storing one on first use.
    pub async fn database_key(
        &self,
        keyring: &Keyring,
        service: ServiceNamespace,
        db_name: &str,
    ) -> Result<DataKey> {
        let uid = keyring.uid();
        let db = self.inner.root.database(uid, service, db_name)?;
        let dek_path = sidecar(&db, DEK_SUFFIX);
        self.user_dir(uid)?;

        let _user = self.lock_user(uid).await;
        let kek = keyring.kek(service).clone();
        blocking(move || load_or_create_dek(&db, &dek_path, &kek)).await
    }

    /// Lend a session on one of the user's databases.
    ///
    /// `schema` is applied to the database when its engine is created.
    pub async fn open_session(
        &self,
        keyring: &Keyring,
        service: ServiceNamespace,
        db_name: &str,
        schema: &Arc<Schema>,
    ) -> Result<Session> {
        let path = self.inner.root.database(keyring.uid(), service, db_name)?;
        let key = self.database_key(keyring, service, db_name).await?;
        self.inner.cache.acquire(&path, schema, &key).await
    }

    /// Re-encrypt an idle database under a fresh DEK.
    ///
    /// The new wrapped DEK is written first with the old one parked at
    /// `_dek.enc.prev`, then the database is re-encrypted, then the parked key is
    /// deleted. An interrupted rotation is settled the next time the DEK is loaded
    /// by checking which key opens the ciphertext.
    pub async fn rotate_database_key(
        &self,
        keyring: &Keyring,
        service: ServiceNamespace,
        db_name: &str,
    ) -> Result<()> {
        let uid = keyring.uid();
        let db = self.inner.root.database(uid, service, db_name)?;
        let dek_path = sidecar(&db, DEK_SUFFIX);
        self.user_dir(uid)?;

        let _user = self.lock_user(uid).await;
        let kek = keyring.kek(service).clone();
        let (old, new, staged) = {
            let (db, dek_path) = (db.clone(), dek_path.clone());
            blocking(move || {
                settle_rotation(&db, &dek_path, &kek)?;
                let old = DataKey::from_bytes(&vault::load(&dek_path, &kek)?)?;
                let new = DataKey::generate();
                let staged = StagedFile::write(&dek_path, &vault::seal(new.as_bytes(), &kek)?)?;
                let stored = vault::load(&dek_path, &kek)?;
                if stored.as_slice() != new.as_bytes() {
                    return Err(VaultError::KeyMaterialCorrupt {
                        path: dek_path,
                        reason: "read-back differs from written key".to_string(),
                    }
                    .into());
                }
                Ok((old, new, staged))
            })
            .await?
        };

        // On failure `staged` drops and puts the old DEK back.
        self.inner.cache.rotate_dek(&db, &old, &new).await?;
        staged.commit()?;
        info!(%uid, %service, db = db_name, "Rotated database key");
        Ok(())
    }

    /// Delete every file of a user.
    ///
    /// Cached engines below the user directory are discarded first. The data is
    /// moved to a tombstone before it is removed, so it disappears in one step
    /// from the point of view of other requests.
    pub async fn delete_user(&self, uid: &Uid) -> Result<()> {
        let _user = self.lock_user(uid).await;
        let dir = self.user_dir(uid)?;
        if !self.inner.keyrings.exists(uid) {
            return Err(AccountError::UserNotFound { uid: uid.clone() }.into());
        }

        let discarded = self.inner.cache.discard_under(&dir).await;
        let tombstone = format!("{TOMBSTONE_PREFIX}{}", Uuid::new_v4());
        let hosted = !self.inner.deployment.provisions_user_dirs();
        let root = self.inner.root.path().to_path_buf();
        blocking(move || {
            if hosted {
                empty_mounted_dir(&dir, &tombstone)
            } else {
                let tombstone = root.join(tombstone);
                fs::rename(&dir, &tombstone)?;
                fs::remove_dir_all(&tombstone)?;
                Ok(())
            }
        })
        .await?;

        info!(%uid, discarded, "Deleted user");
        Ok(())
    }

    /// Remove tombstones left behind by deletions that were interrupted.
    pub async fn sweep_tombstones(&self) -> Result<usize> {
        let root = self.inner.root.path().to_path_buf();
        blocking(move || {
            let mut removed = 0;
            if !root.is_dir() {
                return Ok(0);
            }
            for entry in fs::read_dir(&root)? {
                let path = entry?.path();
                if is_tombstone(&path) {
                    fs::remove_dir_all(&path)?;
                    removed += 1;
                } else if path.is_dir() {
                    for nested in fs::read_dir(&path)? {
                        let nested = nested?.path();
                        if is_tombstone(&nested) {
                            fs::remove_dir_all(&nested)?;
                            removed += 1;
                        }
                    }
                }
            }
            if removed > 0 {
                warn!(removed, "Removed leftover tombstones");
            }
            Ok(removed)
        })
        .await
    }

    /// Every database of `uid` that has a DEK on disk, sorted by path.
    pub async fn databases(&self, uid: &Uid) -> Result<Vec<DatabaseRef>> {
        self.user_dir(uid)?;
        let (root, uid) = (self.inner.root.clone(), uid.clone());
        blocking(move || find_databases(&root, &uid)).await
    }

    /// Run crash recovery on every idle database of the keyring's owner.
    pub async fn recover_user(&self, keyring: &Keyring) -> Result<Vec<(DatabaseRef, Recovery)>> {
        let mut report = Vec::new();
        for db in self.databases(keyring.uid()).await? {
            let key = self.database_key(keyring, db.service, &db.name).await?;
            let recovery = self.inner.cache.recover(&db.path, &key).await?;
            if recovery.is_clean() {
                debug!(path = %db.path.display(), ?recovery, "Database clean");
            } else {
                warn!(path = %db.path.display(), ?recovery, "Recovered database");
            }
            report.push((db, recovery));
        }
        Ok(report)
    }

    /// Seal every live engine, including ones still being created. Call before
    /// the process exits.
    pub async fn shutdown(&self) -> Result<usize> {
        self.inner.cache.shutdown().await
    }

    /// The user directory, if it is present.
    fn user_dir(&self, uid: &Uid) -> Result<PathBuf> {
        let dir = self.inner.root.user_dir(uid);
        if dir.is_dir() {
            Ok(dir)
        } else if self.inner.deployment.provisions_user_dirs() {
            Err(AccountError::UserNotFound { uid: uid.clone() }.into())
        } else {
            Err(AccountError::StorageUnavailable { path: dir }.into())
        }
    }

    async fn lock_user(&self, uid: &Uid) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.inner
                .users
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(uid.clone())
                .or_default(),
        );
        lock.lock_owned().await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(task_failed)?
}

fn load_or_create_dek(db: &Path, dek_path: &Path, kek: &WrappingKey) -> Result<DataKey> {
    settle_rotation(db, dek_path, kek)?;
    match vault::load(dek_path, kek) {
        Ok(bytes) => DataKey::from_bytes(&bytes),
        Err(e) if e.is_not_found() => {
            if let Some(parent) = dek_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let key = DataKey::generate();
            vault::store(key.as_bytes(), kek, dek_path, Overwrite::Forbid)?;
            debug!(path = %dek_path.display(), "Created database key");
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

/// Finish or undo a DEK rotation that left `<dek>.prev` behind.
///
/// Keeps whichever key opens the database's ciphertext.
fn settle_rotation(db: &Path, dek_path: &Path, kek: &WrappingKey) -> Result<()> {
    let parked = sidecar(dek_path, PREVIOUS_SUFFIX);
    if !parked.exists() {
        return Ok(());
    }
    if !dek_path.exists() {
        warn!(path = %dek_path.display(), "Restoring parked database key");
        fs::rename(&parked, dek_path)?;
        return Ok(());
    }

    let sealed = [
        sidecar(db, CIPHERTEXT_SUFFIX),
        sidecar(db, ROLLBACK_SUFFIX),
    ]
    .into_iter()
    .find(|candidate| candidate.exists());
    let rekeyed = vault::load(dek_path, kek)
        .and_then(|bytes| DataKey::from_bytes(&bytes))
        .is_ok_and(|new| {
            sealed
                .as_ref()
                .is_some_and(|sealed| cipher::verify_file(sealed, &new).is_ok())
        });

    if rekeyed {
        debug!(path = %dek_path.display(), "Completing interrupted key rotation");
        remove_if_present(&parked)?;
    } else {
        warn!(path = %dek_path.display(), "Rolling back interrupted key rotation");
        fs::rename(&parked, dek_path)?;
    }
    Ok(())
}

fn find_databases(root: &DataRoot, uid: &Uid) -> Result<Vec<DatabaseRef>> {
    let mut found = Vec::new();
    for service in ServiceNamespace::ALL {
        let service_dir = root.service_dir(uid, service);
        if !service_dir.is_dir() {
            continue;
        }
        let mut pending = vec![service_dir.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = path
                    .strip_prefix(&service_dir)
                    .ok()
                    .and_then(Path::to_str)
                    .and_then(|relative| relative.strip_suffix(DEK_SUFFIX));
                if let Some(name) = name {
                    found.push(DatabaseRef {
                        service,
                        name: name.to_string(),
                        path: service_dir.join(name),
                    });
                }
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

/// Empty a mounted user directory without removing the mount point itself.
///
/// The keyring key goes first so logins fail from the first step on.
fn empty_mounted_dir(dir: &Path, tombstone: &str) -> Result<()> {
    let tombstone = dir.join(tombstone);
    fs::create_dir(&tombstone)?;
    let keyring_key = dir.join(KEYRING_KEY_FILE);
    if keyring_key.exists() {
        fs::rename(&keyring_key, tombstone.join(KEYRING_KEY_FILE))?;
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path() != tombstone {
            fs::rename(entry.path(), tombstone.join(entry.file_name()))?;
        }
    }
    fs::remove_dir_all(&tombstone)?;
    Ok(())
}

fn is_tombstone(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TOMBSTONE_PREFIX))
}
