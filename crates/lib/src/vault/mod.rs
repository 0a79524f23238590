//! Stored-key vault.
//!
//! Wraps small keys under a [`WrappingKey`] with AES-256-GCM and persists them as
//!
//! ```text
//! [12 bytes: nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! with no further metadata. Overwrites go through a `.prev` sidecar: the old file
//! is moved aside, the new one written and read back, and only then is the sidecar
//! deleted. Any failure in between puts the old file back.
//!
//! Login-derived wrapping keys come from PBKDF2-HMAC-SHA256 ([`derive_kek`]).

mod errors;

pub use errors::VaultError;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::{
    Aes256Gcm, Key, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::Result;
use crate::cipher::{NONCE_LENGTH, TAG_LENGTH, remove_if_present};
use crate::constants::PREVIOUS_SUFFIX;
use crate::keys::{WRAPPING_KEY_LENGTH, WrappingKey};
use crate::paths::sidecar;

/// PBKDF2 iteration count for login-derived keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt used by [`derive_kek`].
///
/// Shared by every account so existing wrapped keyring keys stay readable. New
/// deployments should store a per-user salt and call [`derive_kek_with_salt`].
pub const FIXED_SALT: &[u8] = b"lockbox/login-kek/v1";

/// Derive the login wrapping key from a user's master secret.
pub fn derive_kek(secret: &[u8]) -> WrappingKey {
    derive_kek_with_salt(secret, FIXED_SALT)
}

/// Derive a wrapping key with an explicit salt.
pub fn derive_kek_with_salt(secret: &[u8], salt: &[u8]) -> WrappingKey {
    let mut out = [0u8; WRAPPING_KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ITERATIONS, &mut out);
    WrappingKey::from_array(out)
}

/// Wrap `key_bytes` under `kek`.
pub fn seal(key_bytes: &[u8], kek: &WrappingKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, key_bytes)
        .map_err(|e| VaultError::WrapFailed {
            reason: e.to_string(),
        })?;

    let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Unwrap a blob produced by [`seal`].
pub fn unseal(blob: &[u8], kek: &WrappingKey) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(VaultError::Malformed { len: blob.len() }.into());
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::InvalidKey)?;
    Ok(Zeroizing::new(plaintext))
}

/// What [`store`] does when the destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Fail with [`VaultError::AlreadyExists`].
    Forbid,
    /// Replace through a `.prev` sidecar, rolling back on any failure.
    Safely,
}

/// Wrap `key_bytes` under `kek` and persist it at `path`.
///
/// The written file is read back and unwrapped before this returns. A mismatch
/// fails with [`VaultError::KeyMaterialCorrupt`] and leaves the previous file (if
/// any) in place.
pub fn store(
    key_bytes: &[u8],
    kek: &WrappingKey,
    path: impl AsRef<Path>,
    overwrite: Overwrite,
) -> Result<()> {
    let path = path.as_ref();
    let blob = seal(key_bytes, kek)?;

    let staged = match overwrite {
        Overwrite::Forbid => {
            write_private(path, &blob).map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => VaultError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => io_error(path, e),
            })?;
            StagedFile::created(path)
        }
        Overwrite::Safely => StagedFile::write(path, &blob)?,
    };

    verify_stored(path, kek, key_bytes)?;
    staged.commit()?;
    tracing::debug!(path = %path.display(), ?overwrite, "Stored wrapped key");
    Ok(())
}

/// Load and unwrap the key stored at `path`.
pub fn load(path: impl AsRef<Path>, kek: &WrappingKey) -> Result<Zeroizing<Vec<u8>>> {
    let path = path.as_ref();
    let blob = read_file(path)?;
    unseal(&blob, kek)
}

fn verify_stored(path: &Path, kek: &WrappingKey, expected: &[u8]) -> Result<()> {
    let readback = load(path, kek).map_err(|e| VaultError::KeyMaterialCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if readback.as_slice() != expected {
        return Err(VaultError::KeyMaterialCorrupt {
            path: path.to_path_buf(),
            reason: "read-back differs from written key".to_string(),
        }
        .into());
    }
    Ok(())
}

/// A file written in place of an older version that is parked at `<path>.prev`.
///
/// Dropping a `StagedFile` without calling [`StagedFile::commit`] removes the new
/// file and moves the old one back, so several files can be replaced together and
/// rolled back as a unit.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    previous: Option<PathBuf>,
    committed: bool,
}

impl StagedFile {
    /// Replace `path` with `contents`, parking any existing file at `path.prev`.
    pub fn write(path: impl AsRef<Path>, contents: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        let prev = sidecar(path, PREVIOUS_SUFFIX);

        let previous = if path.exists() {
            fs::rename(path, &prev).map_err(|e| io_error(path, e))?;
            Some(prev)
        } else {
            None
        };
        let staged = Self {
            path: path.to_path_buf(),
            previous,
            committed: false,
        };

        // On failure `staged` drops here and puts the previous file back.
        write_private(path, contents).map_err(|e| io_error(path, e))?;
        Ok(staged)
    }

    fn created(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            previous: None,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the new file and delete the parked previous version.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        if let Some(prev) = self.previous.take() {
            remove_if_present(&prev).map_err(|e| io_error(&prev, e))?;
        }
        Ok(())
    }

    /// Discard the new file and restore the previous version.
    pub fn rollback(mut self) -> Result<()> {
        self.committed = true;
        self.restore().map_err(|e| io_error(&self.path, e).into())
    }

    fn restore(&mut self) -> io::Result<()> {
        remove_if_present(&self.path)?;
        if let Some(prev) = self.previous.take() {
            fs::rename(&prev, &self.path)?;
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::warn!(path = %self.path.display(), "Rolling back staged file");
        if let Err(e) = self.restore() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to roll back staged file");
        }
    }
}

/// Create `path` (which must not exist) with owner-only permissions and sync it.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => VaultError::NotFound {
            path: path.to_path_buf(),
        },
        _ => io_error(path, e),
    })?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| io_error(path, e))?;
    Ok(contents)
}

fn io_error(path: &Path, source: io::Error) -> VaultError {
    VaultError::Io {
        path: path.to_path_buf(),
        source,
    }
}
