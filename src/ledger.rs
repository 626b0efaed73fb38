//! Append-only attempt ledger.
//!
//! Every login stage call leaves exactly one immutable record. The ledger is
//! the source of truth for the rate limiter (recent face attempts per source)
//! and for the adaptive laws (consecutive failures per identity). Writes never
//! fail a login: one retry, then the error is logged and dropped.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::{AttemptFilter, StorageResult, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    Credential,
    Face,
    Fallback,
}

impl AttemptStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Face => "face",
            Self::Fallback => "fallback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credential" => Some(Self::Credential),
            "face" => Some(Self::Face),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Blocked,
    Error,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoFaceDetected,
    NoMatch,
    PoseMismatch,
    InvalidCredential,
    InvalidCode,
    SessionExpired,
    TooManyAttempts,
    SystemError,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoFaceDetected => "no_face_detected",
            Self::NoMatch => "no_match",
            Self::PoseMismatch => "pose_mismatch",
            Self::InvalidCredential => "invalid_credential",
            Self::InvalidCode => "invalid_code",
            Self::SessionExpired => "session_expired",
            Self::TooManyAttempts => "too_many_attempts",
            Self::SystemError => "system_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_face_detected" => Some(Self::NoFaceDetected),
            "no_match" => Some(Self::NoMatch),
            "pose_mismatch" => Some(Self::PoseMismatch),
            "invalid_credential" => Some(Self::InvalidCredential),
            "invalid_code" => Some(Self::InvalidCode),
            "session_expired" => Some(Self::SessionExpired),
            "too_many_attempts" => Some(Self::TooManyAttempts),
            "system_error" => Some(Self::SystemError),
            _ => None,
        }
    }
}

/// Immutable audit entry for one login stage call.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub source: String,
    pub identity_id: Option<Uuid>,
    pub stage: AttemptStage,
    pub outcome: AttemptOutcome,
    pub failure_reason: Option<FailureReason>,
    pub confidence_score: Option<f64>,
    /// Seconds spent handling the attempt.
    pub processing_time: Option<f64>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    #[schema(value_type = Object)]
    pub image_metadata: Option<Value>,
    #[schema(value_type = Object)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Request facts shared by every record a single call writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptContext {
    pub source: String,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl AttemptContext {
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attempt(&self, stage: AttemptStage, outcome: AttemptOutcome) -> NewAttempt {
        NewAttempt::new(&self.source, stage, outcome)
            .with_user_agent(self.user_agent.clone())
            .with_session(self.session_id.clone())
    }
}

/// Attempt data collected by a caller before it is stamped and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    source: String,
    stage: AttemptStage,
    outcome: AttemptOutcome,
    identity_id: Option<Uuid>,
    failure_reason: Option<FailureReason>,
    confidence_score: Option<f64>,
    processing_time: Option<Duration>,
    user_agent: Option<String>,
    session_id: Option<String>,
    image_metadata: Option<Value>,
    details: Value,
}

impl NewAttempt {
    #[must_use]
    pub fn new(source: &str, stage: AttemptStage, outcome: AttemptOutcome) -> Self {
        Self {
            source: source.to_string(),
            stage,
            outcome,
            identity_id: None,
            failure_reason: None,
            confidence_score: None,
            processing_time: None,
            user_agent: None,
            session_id: None,
            image_metadata: None,
            details: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity_id: Option<Uuid>) -> Self {
        self.identity_id = identity_id;
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.failure_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence_score = confidence;
        self
    }

    #[must_use]
    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time = Some(elapsed);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    #[must_use]
    pub fn with_image_metadata(mut self, metadata: Option<Value>) -> Self {
        self.image_metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    fn into_record(self) -> AttemptRecord {
        AttemptRecord {
            id: Uuid::now_v7(),
            source: self.source,
            identity_id: self.identity_id,
            stage: self.stage,
            outcome: self.outcome,
            failure_reason: self.failure_reason,
            confidence_score: self.confidence_score,
            processing_time: self.processing_time.map(|elapsed| elapsed.as_secs_f64()),
            user_agent: self.user_agent,
            session_id: self.session_id,
            image_metadata: self.image_metadata,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct AttemptLedger {
    store: Arc<dyn Store>,
}

impl AttemptLedger {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append one attempt. Returns the record id when it was persisted.
    pub async fn record(&self, attempt: NewAttempt) -> Option<Uuid> {
        let record = attempt.into_record();

        for try_number in 1..=2 {
            match self.store.insert_attempt(&record).await {
                Ok(()) => {
                    debug!(
                        attempt_id = %record.id,
                        stage = record.stage.as_str(),
                        outcome = record.outcome.as_str(),
                        "attempt recorded"
                    );
                    return Some(record.id);
                }
                Err(err) if try_number == 1 => {
                    warn!("Failed to record login attempt, retrying: {err}");
                }
                Err(err) => {
                    error!(
                        source = %record.source,
                        stage = record.stage.as_str(),
                        outcome = record.outcome.as_str(),
                        "Dropping login attempt record: {err}"
                    );
                }
            }
        }

        None
    }

    /// Face attempts from `source` within the trailing `window`.
    ///
    /// # Errors
    /// Propagates storage failures; callers decide how to degrade.
    pub async fn recent_attempt_count(
        &self,
        source: &str,
        window: ChronoDuration,
    ) -> StorageResult<u64> {
        let since = Utc::now() - window;
        self.store
            .count_attempts_since(source, AttemptStage::Face, since)
            .await
    }

    /// Consecutive failed face attempts since the identity's last success.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn failed_attempts_for(&self, identity_id: Uuid) -> StorageResult<u32> {
        self.store.consecutive_failures(identity_id).await
    }

    /// # Errors
    /// Propagates storage failures.
    pub async fn list(&self, filter: &AttemptFilter) -> StorageResult<Vec<AttemptRecord>> {
        self.store.list_attempts(filter).await
    }
}
