//! Key material and identity types.
//!
//! Two key widths exist in the hierarchy:
//! - [`WrappingKey`]: 256-bit AES-GCM keys that only ever encrypt other keys
//!   (service KEKs, the keyring key, login-derived keys).
//! - [`DataKey`]: 128-bit AES-GCM keys that encrypt exactly one database file.
//!
//! Both zeroize on drop and never print their bytes.

use std::fmt;

use base64ct::{Base64, Encoding};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Result, vault::VaultError};

/// Length of a data-encryption key in bytes (AES-128).
pub const DEK_LENGTH: usize = 16;

/// Length of a key-wrapping key in bytes (AES-256).
pub const WRAPPING_KEY_LENGTH: usize = 32;

/// Length of a user identifier in hex characters.
pub const UID_LENGTH: usize = 64;

/// Per-database data-encryption key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; DEK_LENGTH]);

impl DataKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEK_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a key from raw bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; DEK_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| VaultError::InvalidKeyLength {
                    expected: DEK_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Key-encryption key. Used for service KEKs, keyring keys and login-derived keys.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey([u8; WRAPPING_KEY_LENGTH]);

impl WrappingKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; WRAPPING_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a key from raw bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; WRAPPING_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| VaultError::InvalidKeyLength {
                    expected: WRAPPING_KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub(crate) fn from_array(bytes: [u8; WRAPPING_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; WRAPPING_KEY_LENGTH] {
        &self.0
    }

    /// Standard base64 form, as carried in tokens and keyring records.
    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.0)
    }

    /// Parse the standard base64 form produced by [`WrappingKey::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = Base64::decode_vec(encoded).map_err(|_| VaultError::InvalidEncoding)?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(<redacted>)")
    }
}

/// Opaque user identifier: lowercase hex SHA-256 of the normalised e-mail.
///
/// Used verbatim as the per-user directory name, so parsing is strict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(String);

impl Uid {
    /// Derive the identifier for an e-mail address.
    ///
    /// The address is trimmed and lowercased first so that `Alice@Example.com `
    /// and `alice@example.com` map to the same user.
    pub fn from_email(email: &str) -> Self {
        let normalised = email.trim().to_lowercase();
        Self(hex::encode(Sha256::digest(normalised.as_bytes())))
    }

    /// Parse an identifier received from outside (tokens, CLI arguments).
    pub fn parse(value: &str) -> std::result::Result<Self, InvalidUid> {
        let valid = value.len() == UID_LENGTH
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidUid(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Uid {
    type Error = InvalidUid;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Uid::parse(&value)
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

/// A string that is not a valid [`Uid`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid user identifier: {0:?}")]
pub struct InvalidUid(pub String);
