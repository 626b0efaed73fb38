//! Multi-stage login driver.
//!
//! Flow Overview:
//! 1) Credential: resolve the identity by username or DNI and open a pending login.
//! 2) Face: rate limit the source, then match the live embedding and pose
//!    against the identity with thresholds adapted to its failure count.
//! 3) Fallback: check DNI plus manual code and issue a token.
//!
//! Each stage call writes exactly one attempt record, whatever the outcome.
//! Failures are reported to callers without saying which check failed.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::session::{CodeStrike, LoginStage, PendingLogins};
use super::token::{IssuedToken, TokenIssuer};
use crate::biometrics::{AdaptiveMatcher, Embedding, Pose, PoseValidator};
use crate::error::AuthError;
use crate::extractor::{extract_with_timeout, EmbeddingExtractor};
use crate::identity::{valid_fallback_code, FallbackCodeHasher, Identity};
use crate::ledger::{AttemptContext, AttemptLedger, AttemptOutcome, AttemptStage, FailureReason};
use crate::limiter::{RateLimitDecision, RateLimiter};
use crate::policy::RecognitionPolicy;
use crate::store::Store;

const DEFAULT_SESSION_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_MAX_WRONG_CODES: u32 = 3;

#[derive(Clone, Debug)]
pub struct LoginConfig {
    session_ttl: Duration,
    extractor_timeout: Duration,
    max_wrong_codes: u32,
    codes: FallbackCodeHasher,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS),
            extractor_timeout: Duration::from_millis(DEFAULT_EXTRACTOR_TIMEOUT_MS),
            max_wrong_codes: DEFAULT_MAX_WRONG_CODES,
            codes: FallbackCodeHasher::new(&[]),
        }
    }
}

impl LoginConfig {
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_extractor_timeout(mut self, timeout: Duration) -> Self {
        self.extractor_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_wrong_codes(mut self, max_wrong_codes: u32) -> Self {
        self.max_wrong_codes = max_wrong_codes.max(1);
        self
    }

    /// Server-side pepper mixed into every fallback code hash.
    #[must_use]
    pub fn with_code_pepper(mut self, pepper: &[u8]) -> Self {
        self.codes = FallbackCodeHasher::new(pepper);
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn extractor_timeout(&self) -> Duration {
        self.extractor_timeout
    }

    #[must_use]
    pub fn max_wrong_codes(&self) -> u32 {
        self.max_wrong_codes
    }

    #[must_use]
    pub fn codes(&self) -> &FallbackCodeHasher {
        &self.codes
    }
}

/// Live face sample: raw image bytes for the extractor or a precomputed vector.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceSample {
    Image(Vec<u8>),
    Embedding(Vec<f32>),
    /// Image payload the transport could not decode.
    Unreadable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacePresentation {
    pub session_id: String,
    pub sample: FaceSample,
    /// `None` when the client pose could not be read.
    pub pose: Option<Pose>,
    pub image_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialAccepted {
    pub session_id: String,
    pub identity_id: Uuid,
    pub next: LoginStage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceAccepted {
    pub session_id: String,
    pub confidence: Option<f64>,
    pub attempt_id: Option<Uuid>,
    pub processing_time: Duration,
    pub next: LoginStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub identity_id: Uuid,
    pub token: IssuedToken,
}

pub struct LoginOrchestrator {
    store: Arc<dyn Store>,
    ledger: AttemptLedger,
    limiter: RateLimiter,
    extractor: Arc<dyn EmbeddingExtractor>,
    tokens: Arc<dyn TokenIssuer>,
    sessions: PendingLogins,
    matcher: AdaptiveMatcher,
    validator: PoseValidator,
    config: LoginConfig,
}

impl LoginOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn EmbeddingExtractor>,
        tokens: Arc<dyn TokenIssuer>,
        config: LoginConfig,
    ) -> Self {
        let ledger = AttemptLedger::new(Arc::clone(&store));
        let limiter = RateLimiter::new(Arc::clone(&store), ledger.clone());
        Self {
            store,
            ledger,
            limiter,
            extractor,
            tokens,
            sessions: PendingLogins::new(config.session_ttl()),
            matcher: AdaptiveMatcher,
            validator: PoseValidator,
            config,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn extractor(&self) -> &dyn EmbeddingExtractor {
        self.extractor.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    /// Credential stage: `identifier` is a username or a DNI.
    ///
    /// # Errors
    /// `AuthenticationFailed` for unknown or inactive identities, `Storage`
    /// when the lookup fails.
    #[instrument(skip(self, context, identifier), fields(source = %context.source, stage = "credential"))]
    pub async fn submit_credential(
        &self,
        context: &AttemptContext,
        identifier: &str,
    ) -> Result<CredentialAccepted, AuthError> {
        let started = Instant::now();
        let identifier = identifier.trim();
        let attempt = |outcome| {
            context
                .attempt(AttemptStage::Credential, outcome)
                .with_processing_time(started.elapsed())
        };

        if identifier.is_empty() {
            self.ledger
                .record(attempt(AttemptOutcome::Failed).with_reason(FailureReason::InvalidCredential))
                .await;
            return Err(AuthError::AuthenticationFailed);
        }

        let lookup = match self.store.find_identity_by_key(identifier).await {
            Ok(found) => found,
            Err(err) => {
                self.ledger
                    .record(attempt(AttemptOutcome::Error).with_reason(FailureReason::SystemError))
                    .await;
                return Err(err.into());
            }
        };

        let Some(identity) = lookup.filter(Identity::is_active) else {
            self.ledger
                .record(attempt(AttemptOutcome::Failed).with_reason(FailureReason::InvalidCredential))
                .await;
            return Err(AuthError::AuthenticationFailed);
        };

        let session_id = self.sessions.start(identity.id).await;
        self.ledger
            .record(
                attempt(AttemptOutcome::Success)
                    .with_identity(Some(identity.id))
                    .with_session(Some(session_id.clone())),
            )
            .await;

        Ok(CredentialAccepted {
            session_id,
            identity_id: identity.id,
            next: LoginStage::AwaitingFace,
        })
    }

    /// Face stage.
    ///
    /// # Errors
    /// `RateLimited` when the source is blocked, `AuthenticationFailed` for
    /// any session, identity, embedding or pose failure, `Storage` when the
    /// limiter or identity store cannot be read.
    #[instrument(skip(self, context, presentation), fields(source = %context.source, stage = "face"))]
    pub async fn submit_face(
        &self,
        context: &AttemptContext,
        presentation: FacePresentation,
    ) -> Result<FaceAccepted, AuthError> {
        let started = Instant::now();
        let context = AttemptContext {
            session_id: Some(presentation.session_id.clone()),
            ..context.clone()
        };
        let policy = RecognitionPolicy::resolve(self.store.as_ref()).await;
        let attempt = |outcome| {
            context
                .attempt(AttemptStage::Face, outcome)
                .with_processing_time(started.elapsed())
                .with_image_metadata(presentation.image_metadata.clone())
        };

        // Held until the attempt below is recorded.
        let _permit = match self.limiter.check(&policy, &context).await {
            Ok(RateLimitDecision::Allowed(permit)) => permit,
            Ok(RateLimitDecision::Blocked {
                blocked_until,
                reason,
            }) => {
                return Err(AuthError::RateLimited {
                    blocked_until,
                    reason,
                });
            }
            Err(err) => {
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Error)
                            .with_reason(FailureReason::SystemError)
                            .with_details(json!({ "type": "rate_limit_unavailable" })),
                    )
                    .await;
                return Err(err.into());
            }
        };

        if matches!(presentation.sample, FaceSample::Unreadable) {
            self.ledger
                .record(
                    attempt(AttemptOutcome::Failed)
                        .with_reason(FailureReason::NoFaceDetected)
                        .with_details(json!({ "type": "invalid_image" })),
                )
                .await;
            return Err(AuthError::validation("Invalid base64 image"));
        }

        let Some(pending) = self
            .sessions
            .expecting(&presentation.session_id, LoginStage::AwaitingFace)
            .await
        else {
            self.ledger
                .record(attempt(AttemptOutcome::Failed).with_reason(FailureReason::SessionExpired))
                .await;
            return Err(AuthError::AuthenticationFailed);
        };

        let identity = match self.store.find_identity(pending.identity_id).await {
            Ok(Some(identity)) if identity.is_active() => identity,
            Ok(_) => {
                self.sessions.finish(&presentation.session_id).await;
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Failed)
                            .with_identity(Some(pending.identity_id))
                            .with_reason(FailureReason::InvalidCredential),
                    )
                    .await;
                return Err(AuthError::AuthenticationFailed);
            }
            Err(err) => {
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Error)
                            .with_identity(Some(pending.identity_id))
                            .with_reason(FailureReason::SystemError),
                    )
                    .await;
                return Err(err.into());
            }
        };

        let failures = policy.cap_failures(self.failure_count(&identity).await);
        let live = self.live_embedding(presentation.sample).await;
        let matched = self
            .matcher
            .evaluate(&policy, &identity.templates, live.as_ref(), failures);
        let posed = self.validator.evaluate(
            &policy,
            &identity.poses,
            presentation.pose.as_ref(),
            failures,
        );

        let details = json!({
            "policy_version": policy.version,
            "failures": failures,
            "face_detected": live.is_some(),
            "embedding_dimensions": live.as_ref().map(Embedding::len),
            "method": matched.method.as_str(),
            "threshold": matched.threshold,
            "distance": matched.distance,
            "similarity": matched.similarity,
            "comparisons": matched.comparisons,
            "pose_schema": posed.schema.map(|schema| schema.as_str()),
            "pose_valid": posed.valid,
            "poses_compared": posed.compared,
        });

        let failure = if live.is_none() {
            Some(FailureReason::NoFaceDetected)
        } else if !matched.matched {
            Some(FailureReason::NoMatch)
        } else if !posed.valid {
            Some(FailureReason::PoseMismatch)
        } else {
            None
        };

        if let Some(reason) = failure {
            let next = policy.cap_failures(failures.saturating_add(1));
            self.persist_failures(identity.id, next).await;
            self.ledger
                .record(
                    attempt(AttemptOutcome::Failed)
                        .with_identity(Some(identity.id))
                        .with_reason(reason)
                        .with_details(details),
                )
                .await;
            info!(
                identity_id = %identity.id,
                reason = reason.as_str(),
                failures = next,
                "Face check rejected"
            );
            return Err(AuthError::AuthenticationFailed);
        }

        self.persist_failures(identity.id, 0).await;
        self.sessions
            .advance(&presentation.session_id, LoginStage::AwaitingFallbackCode)
            .await;

        let confidence = matched.confidence();
        let processing_time = started.elapsed();
        let attempt_id = self
            .ledger
            .record(
                attempt(AttemptOutcome::Success)
                    .with_identity(Some(identity.id))
                    .with_confidence(confidence)
                    .with_details(details),
            )
            .await;
        info!(identity_id = %identity.id, ?confidence, "Face check accepted");

        Ok(FaceAccepted {
            session_id: presentation.session_id,
            confidence,
            attempt_id,
            processing_time,
            next: LoginStage::AwaitingFallbackCode,
        })
    }

    /// Fallback stage: DNI plus manual code.
    ///
    /// # Errors
    /// `AuthenticationFailed` for unknown sessions or wrong values, `Storage`
    /// when the identity cannot be read, `Internal` if no token can be issued.
    #[instrument(skip(self, context, dni, code), fields(source = %context.source, stage = "fallback"))]
    pub async fn submit_fallback(
        &self,
        context: &AttemptContext,
        session_id: &str,
        dni: &str,
        code: &str,
    ) -> Result<Authenticated, AuthError> {
        let started = Instant::now();
        let context = AttemptContext {
            session_id: Some(session_id.to_string()),
            ..context.clone()
        };
        let attempt = |outcome| {
            context
                .attempt(AttemptStage::Fallback, outcome)
                .with_processing_time(started.elapsed())
        };

        let Some(pending) = self
            .sessions
            .expecting(session_id, LoginStage::AwaitingFallbackCode)
            .await
        else {
            self.ledger
                .record(attempt(AttemptOutcome::Failed).with_reason(FailureReason::SessionExpired))
                .await;
            return Err(AuthError::AuthenticationFailed);
        };

        let identity = match self.store.find_identity(pending.identity_id).await {
            Ok(Some(identity)) if identity.is_active() => identity,
            Ok(_) => {
                self.sessions.finish(session_id).await;
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Failed)
                            .with_identity(Some(pending.identity_id))
                            .with_reason(FailureReason::InvalidCredential),
                    )
                    .await;
                return Err(AuthError::AuthenticationFailed);
            }
            Err(err) => {
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Error)
                            .with_identity(Some(pending.identity_id))
                            .with_reason(FailureReason::SystemError),
                    )
                    .await;
                return Err(err.into());
            }
        };

        let code = code.trim();
        let accepted = dni.trim() == identity.dni
            && valid_fallback_code(code)
            && identity.verify_fallback_code(self.config.codes(), code);
        if !accepted {
            let strike = self
                .sessions
                .strike(session_id, self.config.max_wrong_codes)
                .await;
            let remaining = match strike {
                CodeStrike::Retry { remaining } => remaining,
                CodeStrike::Discarded => 0,
            };
            self.ledger
                .record(
                    attempt(AttemptOutcome::Failed)
                        .with_identity(Some(identity.id))
                        .with_reason(FailureReason::InvalidCode)
                        .with_details(json!({ "remaining_codes": remaining })),
                )
                .await;
            return Err(AuthError::AuthenticationFailed);
        }

        let token = match self.tokens.issue(&identity) {
            Ok(token) => token,
            Err(err) => {
                self.ledger
                    .record(
                        attempt(AttemptOutcome::Error)
                            .with_identity(Some(identity.id))
                            .with_reason(FailureReason::SystemError),
                    )
                    .await;
                return Err(AuthError::Internal(format!("{err:#}")));
            }
        };

        self.sessions.finish(session_id).await;
        self.ledger
            .record(attempt(AttemptOutcome::Success).with_identity(Some(identity.id)))
            .await;
        info!(identity_id = %identity.id, "Login completed");

        Ok(Authenticated {
            identity_id: identity.id,
            token,
        })
    }

    /// Ledger-derived failure count, falling back to the persisted counter.
    async fn failure_count(&self, identity: &Identity) -> u32 {
        match self.ledger.failed_attempts_for(identity.id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    identity_id = %identity.id,
                    "Failed to count failures from ledger, using stored counter: {err}"
                );
                identity.failed_attempts
            }
        }
    }

    async fn persist_failures(&self, identity_id: Uuid, failures: u32) {
        if let Err(err) = self.store.set_failed_attempts(identity_id, failures).await {
            warn!(%identity_id, "Failed to update failure counter: {err}");
        }
    }

    async fn live_embedding(&self, sample: FaceSample) -> Option<Embedding> {
        match sample {
            FaceSample::Image(bytes) => {
                extract_with_timeout(
                    self.extractor.as_ref(),
                    &bytes,
                    self.config.extractor_timeout,
                )
                .await
            }
            FaceSample::Embedding(values) => match Embedding::new(values) {
                Ok(embedding) => Some(embedding),
                Err(err) => {
                    warn!("Rejected client embedding: {err}");
                    None
                }
            },
            FaceSample::Unreadable => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometrics::embedding::test_vectors::with_first;
    use crate::biometrics::PlanarPose;
    use crate::extractor::DisabledExtractor;
    use crate::identity::BiometricRegistration;
    use crate::login::token::SessionTokenIssuer;
    use crate::store::{AttemptFilter, MemoryStore};
    use anyhow::Result;

    const POSE: Pose = Pose::Planar(PlanarPose {
        x: 0.5,
        y: 0.5,
        scale: 1.0,
    });

    async fn setup() -> Result<(MemoryStore, LoginOrchestrator, Identity)> {
        let store = MemoryStore::new();
        let config = LoginConfig::default().with_code_pepper(b"test pepper");
        let identity = Identity::new("alice", "12345678");
        store.insert_identity(&identity).await?;
        store
            .register_biometrics(
                identity.id,
                &BiometricRegistration {
                    embeddings: vec![with_first(0.0)],
                    poses: vec![POSE],
                    fallback_code_hash: Some(config.codes().hash("4321")?),
                },
            )
            .await?;
        let orchestrator = LoginOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(DisabledExtractor),
            Arc::new(SessionTokenIssuer::new(60)),
            config,
        );
        Ok((store, orchestrator, identity))
    }

    fn face(session_id: &str, first: f32) -> FacePresentation {
        FacePresentation {
            session_id: session_id.to_string(),
            sample: FaceSample::Embedding(with_first(first).values().to_vec()),
            pose: Some(POSE),
            image_metadata: None,
        }
    }

    #[tokio::test]
    async fn full_login_succeeds() -> Result<()> {
        let (store, orchestrator, identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");

        let credential = orchestrator.submit_credential(&context, "alice").await?;
        assert_eq!(credential.identity_id, identity.id);

        let accepted = orchestrator
            .submit_face(&context, face(&credential.session_id, 0.1))
            .await?;
        assert!(accepted.confidence.is_some_and(|c| c > 0.0));

        let done = orchestrator
            .submit_fallback(&context, &credential.session_id, "12345678", "4321")
            .await?;
        assert_eq!(done.identity_id, identity.id);

        let attempts = store
            .list_attempts(&AttemptFilter {
                limit: 10,
                ..AttemptFilter::default()
            })
            .await?;
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|record| record.outcome == AttemptOutcome::Success));
        Ok(())
    }

    #[tokio::test]
    async fn face_failure_bumps_counter_and_success_resets_it() -> Result<()> {
        let (store, orchestrator, identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");
        let credential = orchestrator.submit_credential(&context, "12345678").await?;

        let rejected = orchestrator
            .submit_face(&context, face(&credential.session_id, 0.9))
            .await;
        assert!(matches!(rejected, Err(AuthError::AuthenticationFailed)));
        let stored = store.find_identity(identity.id).await?;
        assert_eq!(stored.map(|i| i.failed_attempts), Some(1));

        orchestrator
            .submit_face(&context, face(&credential.session_id, 0.0))
            .await?;
        let stored = store.find_identity(identity.id).await?;
        assert_eq!(stored.map(|i| i.failed_attempts), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_session_is_an_authentication_failure() -> Result<()> {
        let (store, orchestrator, _identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");
        let result = orchestrator.submit_face(&context, face("nope", 0.0)).await;
        assert!(matches!(result, Err(AuthError::AuthenticationFailed)));

        let attempts = store
            .list_attempts(&AttemptFilter {
                limit: 10,
                ..AttemptFilter::default()
            })
            .await?;
        assert_eq!(attempts.len(), 1);
        assert_eq!(
            attempts[0].failure_reason,
            Some(FailureReason::SessionExpired)
        );
        Ok(())
    }

    #[tokio::test]
    async fn fallback_requires_face_stage_first() -> Result<()> {
        let (_store, orchestrator, _identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");
        let credential = orchestrator.submit_credential(&context, "alice").await?;
        let result = orchestrator
            .submit_fallback(&context, &credential.session_id, "12345678", "4321")
            .await;
        assert!(matches!(result, Err(AuthError::AuthenticationFailed)));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_codes_discard_the_login() -> Result<()> {
        let (_store, orchestrator, _identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");
        let credential = orchestrator.submit_credential(&context, "alice").await?;
        orchestrator
            .submit_face(&context, face(&credential.session_id, 0.0))
            .await?;

        for _ in 0..3 {
            let result = orchestrator
                .submit_fallback(&context, &credential.session_id, "12345678", "0000")
                .await;
            assert!(matches!(result, Err(AuthError::AuthenticationFailed)));
        }
        let result = orchestrator
            .submit_fallback(&context, &credential.session_id, "12345678", "4321")
            .await;
        assert!(matches!(result, Err(AuthError::AuthenticationFailed)));
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_image_is_rate_limited_like_any_face_attempt() -> Result<()> {
        let (store, orchestrator, _identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.9");
        let unreadable = || FacePresentation {
            session_id: "nope".to_string(),
            sample: FaceSample::Unreadable,
            pose: Some(POSE),
            image_metadata: None,
        };

        for _ in 0..5 {
            let result = orchestrator.submit_face(&context, unreadable()).await;
            assert!(matches!(result, Err(AuthError::Validation(_))));
        }
        let result = orchestrator.submit_face(&context, unreadable()).await;
        assert!(matches!(result, Err(AuthError::RateLimited { .. })));

        let blocked = store
            .list_attempts(&AttemptFilter {
                outcome: Some(AttemptOutcome::Blocked),
                limit: 10,
                ..AttemptFilter::default()
            })
            .await?;
        assert_eq!(blocked.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn storage_outage_on_rate_check_fails_closed() -> Result<()> {
        let (store, orchestrator, _identity) = setup().await?;
        let context = AttemptContext::new("10.0.0.1");
        let credential = orchestrator.submit_credential(&context, "alice").await?;

        store.set_available(false);
        let result = orchestrator
            .submit_face(&context, face(&credential.session_id, 0.0))
            .await;
        assert!(matches!(result, Err(AuthError::Storage(_))));
        Ok(())
    }

    #[test]
    fn config_builders() {
        let config = LoginConfig::default()
            .with_session_ttl(Duration::from_secs(30))
            .with_extractor_timeout(Duration::from_millis(500))
            .with_max_wrong_codes(0);
        assert_eq!(config.session_ttl(), Duration::from_secs(30));
        assert_eq!(config.extractor_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_wrong_codes(), 1);
    }
}
