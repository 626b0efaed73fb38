//! Per-source rate limiting and blocklist.
//!
//! A source is blocked when it already has an active block entry, or when its
//! face attempts inside the policy window reach the per-window cap. Counting is
//! over attempts, not failures. Checks for one source are serialized through a
//! [`SourcePermit`] that the caller keeps until its attempt is recorded, so two
//! concurrent requests cannot both slip under the cap.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::ledger::{AttemptContext, AttemptLedger, AttemptOutcome, AttemptStage, FailureReason};
use crate::policy::RecognitionPolicy;
use crate::store::{StorageResult, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    TooManyAttempts,
    SuspiciousActivity,
    ManualBlock,
    SecurityViolation,
}

impl BlockReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TooManyAttempts => "too_many_attempts",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::ManualBlock => "manual_block",
            Self::SecurityViolation => "security_violation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "too_many_attempts" => Some(Self::TooManyAttempts),
            "suspicious_activity" => Some(Self::SuspiciousActivity),
            "manual_block" => Some(Self::ManualBlock),
            "security_violation" => Some(Self::SecurityViolation),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single denial record of a source address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlockEntry {
    pub source: String,
    pub reason: BlockReason,
    /// How many times this source has been blocked.
    pub trigger_count: u32,
    pub blocked_until: DateTime<Utc>,
    pub permanent: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BlockEntry {
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.permanent || now < self.blocked_until
    }

    #[must_use]
    pub fn is_currently_blocked(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Expiry reported to clients; permanent blocks have none.
    #[must_use]
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        (!self.permanent).then_some(self.blocked_until)
    }
}

/// Exclusive right to check and record attempts for one source.
pub struct SourcePermit {
    source: String,
    _guard: OwnedMutexGuard<()>,
}

impl SourcePermit {
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for SourcePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePermit")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug)]
pub enum RateLimitDecision {
    /// The permit must be held until the attempt has been recorded.
    Allowed(SourcePermit),
    Blocked {
        blocked_until: Option<DateTime<Utc>>,
        reason: BlockReason,
    },
}

impl RateLimitDecision {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Parameters of an administrative block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualBlock {
    pub reason: BlockReason,
    /// Ignored for permanent blocks; the policy block duration when `None`.
    pub duration: Option<ChronoDuration>,
    pub permanent: bool,
    pub notes: Option<String>,
}

impl Default for ManualBlock {
    fn default() -> Self {
        Self {
            reason: BlockReason::ManualBlock,
            duration: None,
            permanent: false,
            notes: None,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    ledger: AttemptLedger,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ledger: AttemptLedger) -> Self {
        Self {
            store,
            ledger,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `source`.
    pub async fn acquire(&self, source: &str) -> SourcePermit {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds or waits on can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(source.to_string()).or_default())
        };

        SourcePermit {
            source: source.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Decide whether `context.source` may attempt a face match now.
    ///
    /// Blocked decisions are recorded in the ledger before returning.
    ///
    /// # Errors
    /// Storage failures are returned unchanged; callers must treat them as a
    /// refusal.
    pub async fn check(
        &self,
        policy: &RecognitionPolicy,
        context: &AttemptContext,
    ) -> StorageResult<RateLimitDecision> {
        let permit = self.acquire(&context.source).await;
        let now = Utc::now();

        let existing = self.store.find_block(&context.source).await?;
        if let Some(entry) = existing.as_ref().filter(|entry| entry.is_active_at(now)) {
            self.record_blocked(context, entry, "ip_blocked").await;
            return Ok(RateLimitDecision::Blocked {
                blocked_until: entry.expiry(),
                reason: entry.reason,
            });
        }

        let recent = self
            .ledger
            .recent_attempt_count(&context.source, policy.attempt_window())
            .await?;
        if recent < u64::from(policy.max_attempts_per_window) {
            return Ok(RateLimitDecision::Allowed(permit));
        }

        let entry = BlockEntry {
            source: context.source.clone(),
            reason: BlockReason::TooManyAttempts,
            trigger_count: existing.map_or(1, |previous| previous.trigger_count.saturating_add(1)),
            blocked_until: now + policy.block_duration(),
            permanent: false,
            notes: Some(format!(
                "{recent} attempts within {} seconds",
                policy.attempt_window_seconds
            )),
            created_at: now,
        };
        self.store.upsert_block(&entry).await?;
        warn!(
            source = %entry.source,
            attempts = recent,
            blocked_until = %entry.blocked_until,
            "Source blocked after too many attempts"
        );
        self.record_blocked(context, &entry, "rate_limit_exceeded").await;

        Ok(RateLimitDecision::Blocked {
            blocked_until: entry.expiry(),
            reason: entry.reason,
        })
    }

    async fn record_blocked(&self, context: &AttemptContext, entry: &BlockEntry, kind: &str) {
        self.ledger
            .record(
                context
                    .attempt(AttemptStage::Face, AttemptOutcome::Blocked)
                    .with_reason(FailureReason::TooManyAttempts)
                    .with_details(json!({
                        "type": kind,
                        "reason": entry.reason.as_str(),
                        "blocked_until": entry.expiry(),
                        "permanent": entry.permanent,
                    })),
            )
            .await;
    }

    /// Block `source` by hand, replacing any existing entry.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn block(
        &self,
        source: &str,
        policy: &RecognitionPolicy,
        request: ManualBlock,
    ) -> StorageResult<BlockEntry> {
        let _permit = self.acquire(source).await;
        let now = Utc::now();
        let previous = self.store.find_block(source).await?;

        let entry = BlockEntry {
            source: source.to_string(),
            reason: request.reason,
            trigger_count: previous.map_or(1, |previous| previous.trigger_count.saturating_add(1)),
            blocked_until: now + request.duration.unwrap_or_else(|| policy.block_duration()),
            permanent: request.permanent,
            notes: request.notes,
            created_at: now,
        };
        self.store.upsert_block(&entry).await?;
        info!(
            source,
            reason = entry.reason.as_str(),
            permanent = entry.permanent,
            "Source blocked manually"
        );

        Ok(entry)
    }

    /// # Errors
    /// Propagates storage failures.
    pub async fn unblock(&self, source: &str) -> StorageResult<bool> {
        let _permit = self.acquire(source).await;
        let removed = self.store.delete_block(source).await?;
        if removed {
            info!(source, "Source unblocked");
        }
        Ok(removed)
    }

    /// # Errors
    /// Propagates storage failures.
    pub async fn list(&self) -> StorageResult<Vec<BlockEntry>> {
        self.store.list_blocks().await
    }
}
