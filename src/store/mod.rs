//! Storage collaborator.
//!
//! The login core talks to persistence only through [`Store`]. Two backends
//! exist: [`MemoryStore`] for tests and development, and [`PgStore`] for
//! Postgres. Filters are equality-based; the only ordering guarantee is
//! "newest first" for attempt listings.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::identity::{BiometricRegistration, Identity};
use crate::ledger::{AttemptOutcome, AttemptRecord, AttemptStage};
use crate::limiter::BlockEntry;
use crate::policy::RecognitionPolicy;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Equality filters for attempt listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptFilter {
    pub identity_id: Option<Uuid>,
    pub source: Option<String>,
    pub outcome: Option<AttemptOutcome>,
    pub limit: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> StorageResult<()>;

    /// # Errors
    /// `StorageError::Conflict` when the username or DNI is taken.
    async fn insert_identity(&self, identity: &Identity) -> StorageResult<()>;

    async fn find_identity(&self, id: Uuid) -> StorageResult<Option<Identity>>;

    /// Match `key` against the primary key (username) or the secondary key (DNI).
    async fn find_identity_by_key(&self, key: &str) -> StorageResult<Option<Identity>>;

    /// Append the registration to the identity in a single write.
    /// Returns `None` for unknown identities.
    async fn register_biometrics(
        &self,
        id: Uuid,
        registration: &BiometricRegistration,
    ) -> StorageResult<Option<Identity>>;

    async fn set_failed_attempts(&self, id: Uuid, failed_attempts: u32) -> StorageResult<()>;

    async fn insert_attempt(&self, record: &AttemptRecord) -> StorageResult<()>;

    /// Attempts of one stage from `source` created at or after `since`.
    async fn count_attempts_since(
        &self,
        source: &str,
        stage: AttemptStage,
        since: DateTime<Utc>,
    ) -> StorageResult<u64>;

    /// Failed face attempts for the identity after its latest successful one.
    async fn consecutive_failures(&self, identity_id: Uuid) -> StorageResult<u32>;

    async fn list_attempts(&self, filter: &AttemptFilter) -> StorageResult<Vec<AttemptRecord>>;

    async fn find_block(&self, source: &str) -> StorageResult<Option<BlockEntry>>;

    /// Insert or replace the single entry for `entry.source`.
    async fn upsert_block(&self, entry: &BlockEntry) -> StorageResult<()>;

    async fn delete_block(&self, source: &str) -> StorageResult<bool>;

    async fn list_blocks(&self) -> StorageResult<Vec<BlockEntry>>;

    async fn active_policy(&self) -> StorageResult<Option<RecognitionPolicy>>;

    /// Store `policy` under a new version and make it the only active one.
    async fn activate_policy(&self, policy: &RecognitionPolicy)
        -> StorageResult<RecognitionPolicy>;

    /// Every stored version, newest first.
    async fn list_policies(&self) -> StorageResult<Vec<RecognitionPolicy>>;
}
