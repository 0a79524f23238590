//! Bearer tokens.
//!
//! Tokens are HS256 JWTs. Besides the user they carry the access secret that binds
//! the token to one login and the keyring key (`kk`) that opens the user's keyring,
//! so a token is as sensitive as the keys it unlocks.

mod errors;

pub use errors::TokenError;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;
use crate::clock::Clock;
use crate::keys::{Uid, WrappingKey};

/// Claims carried by every token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The user
    pub sub: Uid,
    /// Access secret minted at login
    pub sid: Uuid,
    /// Keyring key, standard base64
    pub kk: String,
    pub iat: i64,
    pub exp: i64,
}

impl fmt::Debug for TokenClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenClaims")
            .field("sub", &self.sub)
            .field("sid", &self.sid)
            .field("kk", &"<redacted>")
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .finish()
    }
}

/// A freshly signed token.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub access_secret: Uuid,
    /// Seconds since the Unix epoch
    pub expires_at: i64,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("access_secret", &self.access_secret)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What a verified token grants.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub uid: Uid,
    pub access_secret: Uuid,
    pub keyring_key: WrappingKey,
    pub expires_at: i64,
}

/// Signs and verifies tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
            clock,
        }
    }

    /// Sign a token for `uid` carrying `keyring_key` and a new access secret.
    pub fn issue(&self, uid: &Uid, keyring_key: &WrappingKey) -> Result<IssuedToken> {
        let now = self.clock.now_secs();
        let expires_at = now.saturating_add(i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX));
        let claims = TokenClaims {
            sub: uid.clone(),
            sid: Uuid::new_v4(),
            kk: keyring_key.to_base64(),
            iat: now,
            exp: expires_at,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(
            |e| TokenError::IssueFailed {
                reason: e.to_string(),
            },
        )?;
        Ok(IssuedToken {
            token,
            access_secret: claims.sid,
            expires_at,
        })
    }

    /// Check signature and expiry, then unpack the claims.
    ///
    /// Expiry is judged by this issuer's clock rather than the library's, so a
    /// [`FixedClock`](crate::FixedClock) controls it in tests.
    pub fn verify(&self, token: &str) -> Result<AccessGrant> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let claims = decode::<TokenClaims>(token, &self.decoding, &validation)
            .map_err(TokenError::from)?
            .claims;
        if claims.exp <= self.clock.now_secs() {
            return Err(TokenError::Expired {
                expired_at: claims.exp,
            }
            .into());
        }
        let keyring_key =
            WrappingKey::from_base64(&claims.kk).map_err(|_| TokenError::InvalidKeyringKey)?;

        Ok(AccessGrant {
            uid: claims.sub,
            access_secret: claims.sid,
            keyring_key,
            expires_at: claims.exp,
        })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
