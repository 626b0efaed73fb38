//! Identities and their registered biometrics.
//!
//! An identity is only mutated by registration and by the failure counter the
//! login flow maintains; matching never writes to it.

use argon2::{
    password_hash::SaltString, Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::biometrics::{Embedding, Pose};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Inactive,
    Suspended,
}

impl IdentityStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Registered face templates.
///
/// `Legacy` holds the single vector of records that predate the collection
/// model. The first registration that adds embeddings migrates the identity
/// to `Collection`, with the legacy vector as its first entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceTemplates {
    Collection(Vec<Embedding>),
    Legacy(Embedding),
}

impl Default for FaceTemplates {
    fn default() -> Self {
        Self::Collection(Vec::new())
    }
}

impl FaceTemplates {
    /// Build from the persisted pair of fields.
    #[must_use]
    pub fn from_parts(collection: Vec<Embedding>, legacy: Option<Embedding>) -> Self {
        match legacy {
            Some(legacy) if collection.is_empty() => Self::Legacy(legacy),
            _ => Self::Collection(collection),
        }
    }

    #[must_use]
    pub fn collection(&self) -> &[Embedding] {
        match self {
            Self::Collection(stored) => stored,
            Self::Legacy(_) => &[],
        }
    }

    #[must_use]
    pub fn legacy(&self) -> Option<&Embedding> {
        match self {
            Self::Legacy(stored) => Some(stored),
            Self::Collection(_) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Collection(stored) => stored.len(),
            Self::Legacy(_) => 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&mut self, embeddings: &[Embedding]) {
        if embeddings.is_empty() {
            return;
        }
        match self {
            Self::Collection(stored) => stored.extend_from_slice(embeddings),
            Self::Legacy(legacy) => {
                let mut stored = Vec::with_capacity(embeddings.len() + 1);
                stored.push(legacy.clone());
                stored.extend_from_slice(embeddings);
                *self = Self::Collection(stored);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: Uuid,
    /// Primary lookup key.
    pub username: String,
    /// Secondary lookup key; also the identifier checked at the fallback stage.
    pub dni: String,
    pub status: IdentityStatus,
    pub templates: FaceTemplates,
    pub poses: Vec<Pose>,
    /// Bounded by the policy failure cap. Loosens the embedding threshold and
    /// tightens pose tolerances; it never locks the identity by itself.
    pub failed_attempts: u32,
    /// Argon2id PHC string.
    pub fallback_code_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    #[must_use]
    pub fn new(username: &str, dni: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            username: normalize_username(username),
            dni: dni.trim().to_string(),
            status: IdentityStatus::Active,
            templates: FaceTemplates::default(),
            poses: Vec::new(),
            failed_attempts: 0,
            fallback_code_hash: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == IdentityStatus::Active
    }

    /// Apply a registration in place: one append of embeddings and poses.
    pub fn apply_registration(&mut self, registration: &BiometricRegistration) {
        self.templates.append(&registration.embeddings);
        self.poses.extend_from_slice(&registration.poses);
        if let Some(hash) = &registration.fallback_code_hash {
            self.fallback_code_hash = Some(hash.clone());
        }
    }

    #[must_use]
    pub fn verify_fallback_code(&self, codes: &FallbackCodeHasher, code: &str) -> bool {
        self.fallback_code_hash
            .as_deref()
            .is_some_and(|stored| codes.verify(code, stored))
    }
}

/// Embeddings and poses added by one registration call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiometricRegistration {
    pub embeddings: Vec<Embedding>,
    pub poses: Vec<Pose>,
    pub fallback_code_hash: Option<String>,
}

impl BiometricRegistration {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty() && self.poses.is_empty() && self.fallback_code_hash.is_none()
    }
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub fn valid_username(username: &str) -> bool {
    Regex::new(r"^[a-z0-9][a-z0-9._@-]{2,63}$").is_ok_and(|re| re.is_match(username))
}

pub fn valid_dni(dni: &str) -> bool {
    Regex::new(r"^[0-9A-Za-z]{6,16}$").is_ok_and(|re| re.is_match(dni))
}

/// Manual codes are short numeric strings read out to the user.
pub fn valid_fallback_code(code: &str) -> bool {
    Regex::new(r"^[0-9]{4,12}$").is_ok_and(|re| re.is_match(code))
}

#[derive(Debug, thiserror::Error)]
#[error("fallback code hashing failed: {0}")]
pub struct CodeHashError(String);

/// Argon2id hashing of fallback codes with a server-side pepper.
///
/// Codes are short numeric strings, so a leaked hash must not be reversible
/// without the pepper.
#[derive(Clone)]
pub struct FallbackCodeHasher {
    pepper: Vec<u8>,
}

impl fmt::Debug for FallbackCodeHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackCodeHasher")
            .field("pepper", &"[REDACTED]")
            .finish()
    }
}

impl FallbackCodeHasher {
    #[must_use]
    pub fn new(pepper: &[u8]) -> Self {
        Self {
            pepper: pepper.to_vec(),
        }
    }

    fn argon2(&self) -> Result<Argon2<'_>, CodeHashError> {
        Argon2::new_with_secret(
            &self.pepper,
            Algorithm::Argon2id,
            Version::V0x13,
            Params::default(),
        )
        .map_err(|err| CodeHashError(err.to_string()))
    }

    /// Hash a code into a PHC string; the raw value is never stored.
    ///
    /// # Errors
    /// Returns an error if Argon2 cannot be initialized or hashing fails.
    pub fn hash(&self, code: &str) -> Result<String, CodeHashError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(code.trim().as_bytes(), &salt)
            .map_err(|err| CodeHashError(err.to_string()))?;
        Ok(hash.to_string())
    }

    /// Unparseable stored hashes never verify.
    #[must_use]
    pub fn verify(&self, code: &str, stored: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        self.argon2().is_ok_and(|argon2| {
            argon2
                .verify_password(code.trim().as_bytes(), &parsed)
                .is_ok()
        })
    }
}
