//! Credential tokens handed out after the fallback stage.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::identity::Identity;

const MAX_TTL_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub trait TokenIssuer: Send + Sync {
    /// # Errors
    /// Returns an error if no token could be produced.
    fn issue(&self, identity: &Identity) -> Result<IssuedToken>;
}

/// Opaque random tokens. Only the raw value leaves the process.
#[derive(Debug, Clone)]
pub struct SessionTokenIssuer {
    ttl: ChronoDuration,
}

impl SessionTokenIssuer {
    #[must_use]
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: ChronoDuration::seconds(
                i64::try_from(ttl_seconds)
                    .unwrap_or(MAX_TTL_SECONDS)
                    .min(MAX_TTL_SECONDS),
            ),
        }
    }
}

impl TokenIssuer for SessionTokenIssuer {
    fn issue(&self, _identity: &Identity) -> Result<IssuedToken> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate session token")?;
        Ok(IssuedToken {
            token: Base64UrlUnpadded::encode_string(&bytes),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

/// Digest used to compare or index tokens without keeping them.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
