//! Per-user keyring.
//!
//! A keyring holds one 256-bit KEK per [`ServiceNamespace`]. On disk it is two files
//! in the user's directory:
//!
//! - `keyring.enc`: the keyring record as JSON, sealed under the keyring key (KK)
//! - `keyring_key.enc`: KK, wrapped under the KEK derived from the user's secret
//!
//! KK itself travels inside the bearer token, so request handlers can open the
//! keyring without the user's secret. Every login replaces KK, which invalidates the
//! KK carried by any earlier token.

mod errors;

pub use errors::KeyringError;

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::cipher::remove_if_present;
use crate::constants::PREVIOUS_SUFFIX;
use crate::keys::{Uid, WrappingKey};
use crate::paths::{DataRoot, sidecar};
use crate::vault::{self, StagedFile, VaultError};
use crate::{Error, Result};

/// Services that own a KEK in every keyring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceNamespace {
    Datasources,
    Settings,
    Processing,
    ProcessingStacks,
}

impl ServiceNamespace {
    pub const ALL: [ServiceNamespace; 4] = [
        ServiceNamespace::Datasources,
        ServiceNamespace::Settings,
        ServiceNamespace::Processing,
        ServiceNamespace::ProcessingStacks,
    ];

    /// Directory and record field name.
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceNamespace::Datasources => "datasources",
            ServiceNamespace::Settings => "settings",
            ServiceNamespace::Processing => "processing",
            ServiceNamespace::ProcessingStacks => "processing_stacks",
        }
    }
}

impl fmt::Display for ServiceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string that names no known namespace.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown service namespace: {0:?}")]
pub struct UnknownNamespace(pub String);

impl FromStr for ServiceNamespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ServiceNamespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| UnknownNamespace(s.to_string()))
    }
}

/// Serialized form. Fields are in alphabetical order so the JSON is canonical.
#[derive(Serialize, Deserialize)]
struct KeyringRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datasources: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processing_stacks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settings: Option<String>,
    uid: Uid,
}

/// Immutable snapshot of a user's KEKs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    uid: Uid,
    datasources: WrappingKey,
    settings: WrappingKey,
    processing: WrappingKey,
    processing_stacks: WrappingKey,
}

impl Keyring {
    fn generate(uid: Uid) -> Self {
        Self {
            uid,
            datasources: WrappingKey::generate(),
            settings: WrappingKey::generate(),
            processing: WrappingKey::generate(),
            processing_stacks: WrappingKey::generate(),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// The KEK that wraps every DEK of `namespace`.
    pub fn kek(&self, namespace: ServiceNamespace) -> &WrappingKey {
        match namespace {
            ServiceNamespace::Datasources => &self.datasources,
            ServiceNamespace::Settings => &self.settings,
            ServiceNamespace::Processing => &self.processing,
            ServiceNamespace::ProcessingStacks => &self.processing_stacks,
        }
    }

    fn seal(&self, keyring_key: &WrappingKey) -> Result<Vec<u8>> {
        let record = KeyringRecord {
            datasources: Some(self.datasources.to_base64()),
            processing: Some(self.processing.to_base64()),
            processing_stacks: Some(self.processing_stacks.to_base64()),
            settings: Some(self.settings.to_base64()),
            uid: self.uid.clone(),
        };
        let json = Zeroizing::new(serde_json::to_vec(&record)?);
        vault::seal(&json, keyring_key)
    }

    /// Open a sealed record. With `upgrade`, namespaces missing from the record get a
    /// fresh KEK and the returned flag is set.
    fn unseal(
        uid: &Uid,
        blob: &[u8],
        keyring_key: &WrappingKey,
        upgrade: bool,
    ) -> Result<(Self, bool)> {
        let json = vault::unseal(blob, keyring_key)?;
        let record: KeyringRecord =
            serde_json::from_slice(&json).map_err(|e| KeyringError::Malformed {
                reason: e.to_string(),
            })?;
        if &record.uid != uid {
            return Err(KeyringError::UidMismatch {
                expected: uid.clone(),
                found: record.uid,
            }
            .into());
        }

        let mut upgraded = false;
        let mut field = |value: Option<String>, namespace: ServiceNamespace| -> Result<WrappingKey> {
            match value {
                Some(encoded) => {
                    WrappingKey::from_base64(&encoded).map_err(|e| {
                        KeyringError::Malformed {
                            reason: format!("{namespace}: {e}"),
                        }
                        .into()
                    })
                }
                None if upgrade => {
                    upgraded = true;
                    Ok(WrappingKey::generate())
                }
                None => Err(KeyringError::NamespaceMissing { namespace }.into()),
            }
        };

        let keyring = Self {
            datasources: field(record.datasources, ServiceNamespace::Datasources)?,
            settings: field(record.settings, ServiceNamespace::Settings)?,
            processing: field(record.processing, ServiceNamespace::Processing)?,
            processing_stacks: field(record.processing_stacks, ServiceNamespace::ProcessingStacks)?,
            uid: record.uid,
        };
        Ok((keyring, upgraded))
    }
}

/// Reads and writes keyring files below a data root.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    root: DataRoot,
}

impl KeyringStore {
    pub fn new(root: DataRoot) -> Self {
        Self { root }
    }

    pub fn exists(&self, uid: &Uid) -> bool {
        self.root.keyring_key(uid).exists()
    }

    /// Create the keyring of a new user.
    ///
    /// The user directory must already exist. Returns the keyring and the keyring key
    /// to embed in the first token.
    pub fn create(&self, uid: &Uid, login_kek: &WrappingKey) -> Result<(Keyring, WrappingKey)> {
        let ring_path = self.root.keyring(uid);
        let key_path = self.root.keyring_key(uid);
        if key_path.exists() || ring_path.exists() {
            return Err(KeyringError::AlreadyExists { uid: uid.clone() }.into());
        }

        let keyring = Keyring::generate(uid.clone());
        let keyring_key = WrappingKey::generate();
        let ring = StagedFile::write(&ring_path, &keyring.seal(&keyring_key)?)?;
        let key = StagedFile::write(&key_path, &vault::seal(keyring_key.as_bytes(), login_kek)?)?;

        self.validate(uid, login_kek, &keyring, &keyring_key)?;
        commit_pair(key, ring)?;

        tracing::info!(%uid, "Created keyring");
        Ok((keyring, keyring_key))
    }

    /// Re-seal the keyring under a fresh keyring key.
    ///
    /// Both files are replaced through `.prev` sidecars and validated by reloading
    /// them through `login_kek`. On validation failure the previous pair is restored
    /// and the error is [`KeyringError::KeyMaterialCorrupt`]. Namespaces the stored
    /// record lacks gain a KEK as part of the rotation.
    pub fn rotate(&self, uid: &Uid, login_kek: &WrappingKey) -> Result<(Keyring, WrappingKey)> {
        self.rotate_checked(uid, login_kek, |_| Ok(()))
    }

    /// [`KeyringStore::rotate`] with an extra check that runs after both new files are
    /// in place and before either sidecar is deleted.
    #[cfg(any(test, feature = "testing"))]
    pub fn rotate_with_check<F>(
        &self,
        uid: &Uid,
        login_kek: &WrappingKey,
        check: F,
    ) -> Result<(Keyring, WrappingKey)>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        self.rotate_checked(uid, login_kek, check)
    }

    pub(crate) fn rotate_checked<F>(
        &self,
        uid: &Uid,
        login_kek: &WrappingKey,
        check: F,
    ) -> Result<(Keyring, WrappingKey)>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        self.recover_interrupted_rotation(uid, login_kek)?;

        let current = self.unlock(uid, login_kek)?;
        let blob = self.read_keyring(uid)?;
        let (keyring, upgraded) = Keyring::unseal(uid, &blob, &current, true)?;
        if upgraded {
            tracing::info!(%uid, "Adding missing namespaces to keyring");
        }

        let next = WrappingKey::generate();
        let ring = StagedFile::write(self.root.keyring(uid), &keyring.seal(&next)?)?;
        let key = StagedFile::write(
            self.root.keyring_key(uid),
            &vault::seal(next.as_bytes(), login_kek)?,
        )?;

        self.validate(uid, login_kek, &keyring, &next)?;
        check(self.root.user_dir(uid).as_path()).map_err(|e| corrupt(uid, e))?;
        commit_pair(key, ring)?;

        tracing::info!(%uid, "Rotated keyring key");
        Ok((keyring, next))
    }

    /// Decrypt the keyring with the keyring key carried by a token.
    pub fn open(&self, uid: &Uid, keyring_key: &WrappingKey) -> Result<Keyring> {
        let blob = self.read_keyring(uid)?;
        let (keyring, _) = Keyring::unseal(uid, &blob, keyring_key, false)?;
        Ok(keyring)
    }

    /// Unwrap the stored keyring key with the login KEK.
    fn unlock(&self, uid: &Uid, login_kek: &WrappingKey) -> Result<WrappingKey> {
        let bytes = vault::load(self.root.keyring_key(uid), login_kek)
            .map_err(|e| not_found_as_keyring(uid, e))?;
        WrappingKey::from_bytes(&bytes)
    }

    fn read_keyring(&self, uid: &Uid) -> Result<Vec<u8>> {
        vault::read_file(&self.root.keyring(uid)).map_err(|e| not_found_as_keyring(uid, e))
    }

    fn validate(
        &self,
        uid: &Uid,
        login_kek: &WrappingKey,
        expected: &Keyring,
        keyring_key: &WrappingKey,
    ) -> Result<()> {
        let reloaded = self.unlock(uid, login_kek).map_err(|e| corrupt(uid, e))?;
        if &reloaded != keyring_key {
            return Err(KeyringError::KeyMaterialCorrupt {
                uid: uid.clone(),
                reason: "keyring key read-back differs".to_string(),
            }
            .into());
        }
        let opened = self.open(uid, &reloaded).map_err(|e| corrupt(uid, e))?;
        if &opened != expected {
            return Err(KeyringError::KeyMaterialCorrupt {
                uid: uid.clone(),
                reason: "keyring read-back differs".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Put back a consistent pair of files after a rotation was interrupted.
    ///
    /// Sidecars are only left behind by a crash. The previous pair is preferred
    /// because no token was ever issued for the new one.
    fn recover_interrupted_rotation(&self, uid: &Uid, login_kek: &WrappingKey) -> Result<()> {
        let key_path = self.root.keyring_key(uid);
        let ring_path = self.root.keyring(uid);
        let key_prev = sidecar(&key_path, PREVIOUS_SUFFIX);
        let ring_prev = sidecar(&ring_path, PREVIOUS_SUFFIX);
        if !key_prev.exists() && !ring_prev.exists() {
            return Ok(());
        }

        let candidates = [
            (&key_prev, &ring_prev),
            (&key_path, &ring_path),
            (&key_prev, &ring_path),
            (&key_path, &ring_prev),
        ];
        for (key, ring) in candidates {
            if !key.exists() || !ring.exists() || !pair_opens(uid, login_kek, key, ring) {
                continue;
            }
            tracing::warn!(%uid, key = %key.display(), ring = %ring.display(), "Recovering keyring after interrupted rotation");
            if key != &key_path {
                fs::rename(key, &key_path)?;
            }
            if ring != &ring_path {
                fs::rename(ring, &ring_path)?;
            }
            remove_if_present(&key_prev)?;
            remove_if_present(&ring_prev)?;
            return Ok(());
        }

        // Nothing opens with this secret; leave the files for a correct one.
        tracing::warn!(%uid, "Keyring sidecars present but no pair opens");
        Ok(())
    }
}

fn pair_opens(uid: &Uid, login_kek: &WrappingKey, key: &Path, ring: &Path) -> bool {
    let open = || -> Result<Keyring> {
        let keyring_key = WrappingKey::from_bytes(&vault::load(key, login_kek)?)?;
        let blob = vault::read_file(ring)?;
        Keyring::unseal(uid, &blob, &keyring_key, true).map(|(keyring, _)| keyring)
    };
    open().is_ok()
}

fn commit_pair(key: StagedFile, ring: StagedFile) -> Result<()> {
    let key_done = key.commit();
    let ring_done = ring.commit();
    key_done.and(ring_done)
}

fn corrupt(uid: &Uid, source: Error) -> Error {
    KeyringError::KeyMaterialCorrupt {
        uid: uid.clone(),
        reason: source.to_string(),
    }
    .into()
}

fn not_found_as_keyring(uid: &Uid, err: Error) -> Error {
    match err {
        Error::Vault(VaultError::NotFound { .. }) => {
            KeyringError::NotFound { uid: uid.clone() }.into()
        }
        other => other,
    }
}
