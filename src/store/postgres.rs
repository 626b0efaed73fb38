//! Postgres [`Store`] backed by `sqlx`.
//!
//! Schema lives in `db/sql/01_facegate.sql`. Embeddings and poses are JSONB
//! lists on the identity row so a login reads all of them in one query and a
//! registration appends them in one update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};
use std::time::Duration;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{AttemptFilter, StorageError, StorageResult, Store};
use crate::biometrics::{Embedding, Pose};
use crate::identity::{BiometricRegistration, FaceTemplates, Identity, IdentityStatus};
use crate::ledger::{AttemptOutcome, AttemptRecord, AttemptStage, FailureReason};
use crate::limiter::{BlockEntry, BlockReason};
use crate::policy::RecognitionPolicy;

const UNIQUE_VIOLATION: &str = "23505";

const IDENTITY_COLUMNS: &str = "id, username, dni, status, facial_embeddings, facial_embedding, \
     positions, failed_attempts, fallback_code_hash, created_at";

const ATTEMPT_COLUMNS: &str = "id, source, identity_id, stage, outcome, failure_reason, \
     confidence_score, processing_time, user_agent, session_id, image_metadata, details, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if no connection can be established.
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn from_db_total(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_status(value: &str) -> StorageResult<IdentityStatus> {
    IdentityStatus::parse(value)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown identity status: {value}")))
}

fn parse_stage(value: &str) -> StorageResult<AttemptStage> {
    AttemptStage::parse(value)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown attempt stage: {value}")))
}

fn parse_outcome(value: &str) -> StorageResult<AttemptOutcome> {
    AttemptOutcome::parse(value)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown attempt outcome: {value}")))
}

fn parse_block_reason(value: &str) -> StorageResult<BlockReason> {
    BlockReason::parse(value)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown block reason: {value}")))
}

fn identity_from_row(row: &PgRow) -> StorageResult<Identity> {
    let status: String = row.try_get("status")?;
    let Json(collection): Json<Vec<Embedding>> = row.try_get("facial_embeddings")?;
    let legacy: Option<Json<Embedding>> = row.try_get("facial_embedding")?;
    let Json(poses): Json<Vec<Pose>> = row.try_get("positions")?;

    Ok(Identity {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        dni: row.try_get("dni")?,
        status: parse_status(&status)?,
        templates: FaceTemplates::from_parts(collection, legacy.map(|Json(legacy)| legacy)),
        poses,
        failed_attempts: from_db_count(row.try_get("failed_attempts")?),
        fallback_code_hash: row.try_get("fallback_code_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> StorageResult<AttemptRecord> {
    let stage: String = row.try_get("stage")?;
    let outcome: String = row.try_get("outcome")?;
    let reason: Option<String> = row.try_get("failure_reason")?;
    let image_metadata: Option<Json<serde_json::Value>> = row.try_get("image_metadata")?;
    let Json(details): Json<serde_json::Value> = row.try_get("details")?;

    Ok(AttemptRecord {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        identity_id: row.try_get("identity_id")?,
        stage: parse_stage(&stage)?,
        outcome: parse_outcome(&outcome)?,
        failure_reason: reason.as_deref().and_then(FailureReason::parse),
        confidence_score: row.try_get("confidence_score")?,
        processing_time: row.try_get("processing_time")?,
        user_agent: row.try_get("user_agent")?,
        session_id: row.try_get("session_id")?,
        image_metadata: image_metadata.map(|Json(value)| value),
        details,
        created_at: row.try_get("created_at")?,
    })
}

fn block_from_row(row: &PgRow) -> StorageResult<BlockEntry> {
    let reason: String = row.try_get("reason")?;
    Ok(BlockEntry {
        source: row.try_get("source")?,
        reason: parse_block_reason(&reason)?,
        trigger_count: from_db_count(row.try_get("trigger_count")?),
        blocked_until: row.try_get("blocked_until")?,
        permanent: row.try_get("permanent")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn policy_from_row(row: &PgRow) -> StorageResult<RecognitionPolicy> {
    let Json(mut policy): Json<RecognitionPolicy> = row.try_get("settings")?;
    policy.version = row.try_get("version")?;
    policy.name = row.try_get("name")?;
    Ok(policy)
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StorageResult<()> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(())
    }

    async fn insert_identity(&self, identity: &Identity) -> StorageResult<()> {
        let query = r"
            INSERT INTO identities
                (id, username, dni, status, facial_embeddings, facial_embedding,
                 positions, failed_attempts, fallback_code_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        let result = sqlx::query(query)
            .bind(identity.id)
            .bind(&identity.username)
            .bind(&identity.dni)
            .bind(identity.status.as_str())
            .bind(Json(identity.templates.collection()))
            .bind(identity.templates.legacy().map(Json))
            .bind(Json(&identity.poses))
            .bind(to_db_count(identity.failed_attempts))
            .bind(identity.fallback_code_hash.as_deref())
            .bind(identity.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::Conflict(format!(
                "identity {} already exists",
                identity.username
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_identity(&self, id: Uuid) -> StorageResult<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn find_identity_by_key(&self, key: &str) -> StorageResult<Option<Identity>> {
        // Username wins over DNI when both would match.
        let query = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities \
             WHERE username = $1 OR dni = $1 \
             ORDER BY (username = $1) DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn register_biometrics(
        &self,
        id: Uuid,
        registration: &BiometricRegistration,
    ) -> StorageResult<Option<Identity>> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", &select))
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut identity = identity_from_row(&row)?;
        identity.apply_registration(registration);

        let update = r"
            UPDATE identities
            SET facial_embeddings = $2,
                facial_embedding = $3,
                positions = $4,
                fallback_code_hash = $5
            WHERE id = $1
        ";
        sqlx::query(update)
            .bind(id)
            .bind(Json(identity.templates.collection()))
            .bind(identity.templates.legacy().map(Json))
            .bind(Json(&identity.poses))
            .bind(identity.fallback_code_hash.as_deref())
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", update))
            .await?;

        tx.commit().await?;
        Ok(Some(identity))
    }

    async fn set_failed_attempts(&self, id: Uuid, failed_attempts: u32) -> StorageResult<()> {
        let query = "UPDATE identities SET failed_attempts = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(to_db_count(failed_attempts))
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn insert_attempt(&self, record: &AttemptRecord) -> StorageResult<()> {
        let query = format!(
            "INSERT INTO login_attempts ({ATTEMPT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        sqlx::query(&query)
            .bind(record.id)
            .bind(&record.source)
            .bind(record.identity_id)
            .bind(record.stage.as_str())
            .bind(record.outcome.as_str())
            .bind(record.failure_reason.map(FailureReason::as_str))
            .bind(record.confidence_score)
            .bind(record.processing_time)
            .bind(record.user_agent.as_deref())
            .bind(record.session_id.as_deref())
            .bind(record.image_metadata.as_ref().map(Json))
            .bind(Json(&record.details))
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await?;
        Ok(())
    }

    async fn count_attempts_since(
        &self,
        source: &str,
        stage: AttemptStage,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let query = r"
            SELECT COUNT(*) AS count
            FROM login_attempts
            WHERE source = $1 AND stage = $2 AND created_at >= $3
        ";
        let row = sqlx::query(query)
            .bind(source)
            .bind(stage.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(from_db_total(row.try_get("count")?))
    }

    async fn consecutive_failures(&self, identity_id: Uuid) -> StorageResult<u32> {
        let query = r"
            SELECT COUNT(*) AS count
            FROM login_attempts
            WHERE identity_id = $1
              AND stage = 'face'
              AND outcome = 'failed'
              AND created_at > COALESCE(
                  (SELECT MAX(created_at)
                   FROM login_attempts
                   WHERE identity_id = $1 AND stage = 'face' AND outcome = 'success'),
                  '-infinity'::timestamptz)
        ";
        let row = sqlx::query(query)
            .bind(identity_id)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_attempts(&self, filter: &AttemptFilter) -> StorageResult<Vec<AttemptRecord>> {
        let query = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM login_attempts \
             WHERE ($1::uuid IS NULL OR identity_id = $1) \
               AND ($2::text IS NULL OR source = $2) \
               AND ($3::text IS NULL OR outcome = $3) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $4"
        );
        let rows = sqlx::query(&query)
            .bind(filter.identity_id)
            .bind(filter.source.as_deref())
            .bind(filter.outcome.map(AttemptOutcome::as_str))
            .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn find_block(&self, source: &str) -> StorageResult<Option<BlockEntry>> {
        let query = r"
            SELECT source, reason, trigger_count, blocked_until, permanent, notes, created_at
            FROM blocked_sources
            WHERE source = $1
        ";
        let row = sqlx::query(query)
            .bind(source)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn upsert_block(&self, entry: &BlockEntry) -> StorageResult<()> {
        let query = r"
            INSERT INTO blocked_sources
                (source, reason, trigger_count, blocked_until, permanent, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source) DO UPDATE
            SET reason = EXCLUDED.reason,
                trigger_count = EXCLUDED.trigger_count,
                blocked_until = EXCLUDED.blocked_until,
                permanent = EXCLUDED.permanent,
                notes = EXCLUDED.notes,
                created_at = EXCLUDED.created_at
        ";
        sqlx::query(query)
            .bind(&entry.source)
            .bind(entry.reason.as_str())
            .bind(to_db_count(entry.trigger_count))
            .bind(entry.blocked_until)
            .bind(entry.permanent)
            .bind(entry.notes.as_deref())
            .bind(entry.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn delete_block(&self, source: &str) -> StorageResult<bool> {
        let query = "DELETE FROM blocked_sources WHERE source = $1";
        let result = sqlx::query(query)
            .bind(source)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_blocks(&self) -> StorageResult<Vec<BlockEntry>> {
        let query = r"
            SELECT source, reason, trigger_count, blocked_until, permanent, notes, created_at
            FROM blocked_sources
            ORDER BY created_at DESC
        ";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn active_policy(&self) -> StorageResult<Option<RecognitionPolicy>> {
        let query = r"
            SELECT version, name, settings
            FROM recognition_policies
            WHERE is_active
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn activate_policy(
        &self,
        policy: &RecognitionPolicy,
    ) -> StorageResult<RecognitionPolicy> {
        let mut tx = self.pool.begin().await?;

        let deactivate = "UPDATE recognition_policies SET is_active = FALSE WHERE is_active";
        sqlx::query(deactivate)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", deactivate))
            .await?;

        let insert = r"
            INSERT INTO recognition_policies (name, settings, is_active)
            VALUES ($1, $2, TRUE)
            RETURNING version
        ";
        let row = sqlx::query(insert)
            .bind(&policy.name)
            .bind(Json(policy))
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", insert))
            .await?;
        let version: i64 = row.try_get("version")?;

        tx.commit().await?;
        Ok(RecognitionPolicy {
            version,
            ..policy.clone()
        })
    }

    async fn list_policies(&self) -> StorageResult<Vec<RecognitionPolicy>> {
        let query = r"
            SELECT version, name, settings
            FROM recognition_policies
            ORDER BY version DESC
        ";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        rows.iter().map(policy_from_row).collect()
    }
}
