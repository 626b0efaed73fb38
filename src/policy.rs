//! Recognition policy: the versioned knobs behind matching, pose checks and
//! rate limiting.
//!
//! Exactly one policy is active at a time. When the store has none (or cannot
//! be read) the built-in default is used, so a login attempt always runs
//! against a usable policy. The resolved value is handed to each component
//! explicitly.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::store::Store;

const DEFAULT_POLICY_NAME: &str = "default";
const DEFAULT_FAILURE_CAP: u32 = 5;
const DEFAULT_ATTEMPT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS_PER_WINDOW: u32 = 5;
const DEFAULT_BLOCK_DURATION_MINUTES: u32 = 15;
const DEFAULT_LEGACY_COSINE_MIN: f64 = 0.95;
const MAX_ATTEMPT_WINDOW_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Acceptance bound that loosens with failures, up to a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThresholdLaw {
    pub base: f64,
    pub step: f64,
    pub ceiling: f64,
}

impl ThresholdLaw {
    #[must_use]
    pub fn at(&self, failures: u32) -> f64 {
        let raised = self.base + self.step.max(0.0) * f64::from(failures);
        raised.min(self.ceiling)
    }
}

/// Acceptance bound that tightens with failures, down to a hard floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToleranceLaw {
    pub start: f64,
    pub step: f64,
    pub floor: f64,
}

impl ToleranceLaw {
    #[must_use]
    pub fn at(&self, failures: u32) -> f64 {
        let lowered = self.start - self.step.max(0.0) * f64::from(failures);
        lowered.max(self.floor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy name must not be empty")]
    EmptyName,
    #[error("{0} must be finite and non-negative")]
    InvalidBound(&'static str),
    #[error("{0}: ceiling must not be below base")]
    CeilingBelowBase(&'static str),
    #[error("{0}: floor must not exceed start")]
    FloorAboveStart(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecognitionPolicy {
    /// Assigned by the store when the policy is activated.
    #[serde(default)]
    pub version: i64,
    pub name: String,
    /// Euclidean distance a live embedding must stay strictly below.
    pub distance_threshold: ThresholdLaw,
    /// Minimum cosine similarity for identities that only carry a legacy vector.
    pub legacy_cosine_min: f64,
    pub planar_xy_tolerance: ToleranceLaw,
    pub planar_scale_tolerance: ToleranceLaw,
    /// Applies to roll, pitch and yaw, in degrees.
    pub angular_degrees_tolerance: ToleranceLaw,
    pub angular_distance_tolerance: ToleranceLaw,
    /// Upper bound of an identity's failure counter.
    pub failure_cap: u32,
    pub attempt_window_seconds: u64,
    pub max_attempts_per_window: u32,
    pub block_duration_minutes: u32,
}

impl Default for RecognitionPolicy {
    fn default() -> Self {
        Self {
            version: 0,
            name: DEFAULT_POLICY_NAME.to_string(),
            distance_threshold: ThresholdLaw {
                base: 0.45,
                step: 0.02,
                ceiling: 0.55,
            },
            legacy_cosine_min: DEFAULT_LEGACY_COSINE_MIN,
            planar_xy_tolerance: ToleranceLaw {
                start: 0.10,
                step: 0.01,
                floor: 0.05,
            },
            planar_scale_tolerance: ToleranceLaw {
                start: 0.10,
                step: 0.015,
                floor: 0.03,
            },
            angular_degrees_tolerance: ToleranceLaw {
                start: 15.0,
                step: 1.5,
                floor: 8.0,
            },
            angular_distance_tolerance: ToleranceLaw {
                start: 0.15,
                step: 0.02,
                floor: 0.08,
            },
            failure_cap: DEFAULT_FAILURE_CAP,
            attempt_window_seconds: DEFAULT_ATTEMPT_WINDOW_SECONDS,
            max_attempts_per_window: DEFAULT_MAX_ATTEMPTS_PER_WINDOW,
            block_duration_minutes: DEFAULT_BLOCK_DURATION_MINUTES,
        }
    }
}

impl RecognitionPolicy {
    /// Active policy from the store, or the default when none is usable.
    pub async fn resolve(store: &dyn Store) -> Self {
        match store.active_policy().await {
            Ok(Some(policy)) => match policy.validate() {
                Ok(()) => policy,
                Err(err) => {
                    warn!(
                        version = policy.version,
                        "Active recognition policy is invalid ({err}), using default"
                    );
                    Self::default()
                }
            },
            Ok(None) => Self::default(),
            Err(err) => {
                warn!("Failed to load recognition policy, using default: {err}");
                Self::default()
            }
        }
    }

    /// # Errors
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }

        let threshold = &self.distance_threshold;
        for (label, value) in [
            ("distance_threshold.base", threshold.base),
            ("distance_threshold.step", threshold.step),
            ("distance_threshold.ceiling", threshold.ceiling),
            ("legacy_cosine_min", self.legacy_cosine_min),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PolicyError::InvalidBound(label));
            }
        }
        if threshold.ceiling < threshold.base {
            return Err(PolicyError::CeilingBelowBase("distance_threshold"));
        }

        for (label, law) in [
            ("planar_xy_tolerance", &self.planar_xy_tolerance),
            ("planar_scale_tolerance", &self.planar_scale_tolerance),
            ("angular_degrees_tolerance", &self.angular_degrees_tolerance),
            ("angular_distance_tolerance", &self.angular_distance_tolerance),
        ] {
            if [law.start, law.step, law.floor]
                .iter()
                .any(|value| !value.is_finite() || *value < 0.0)
            {
                return Err(PolicyError::InvalidBound(label));
            }
            if law.floor > law.start {
                return Err(PolicyError::FloorAboveStart(label));
            }
        }

        if self.failure_cap == 0 {
            return Err(PolicyError::Zero("failure_cap"));
        }
        if self.attempt_window_seconds == 0 {
            return Err(PolicyError::Zero("attempt_window_seconds"));
        }
        if self.attempt_window_seconds > MAX_ATTEMPT_WINDOW_SECONDS {
            return Err(PolicyError::InvalidBound("attempt_window_seconds"));
        }
        if self.max_attempts_per_window == 0 {
            return Err(PolicyError::Zero("max_attempts_per_window"));
        }
        if self.block_duration_minutes == 0 {
            return Err(PolicyError::Zero("block_duration_minutes"));
        }

        Ok(())
    }

    #[must_use]
    pub fn attempt_window(&self) -> ChronoDuration {
        let seconds = self.attempt_window_seconds.min(MAX_ATTEMPT_WINDOW_SECONDS);
        ChronoDuration::seconds(i64::try_from(seconds).unwrap_or(0))
    }

    #[must_use]
    pub fn block_duration(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.block_duration_minutes))
    }

    /// Clamp a raw failure count into `[0, failure_cap]`.
    #[must_use]
    pub fn cap_failures(&self, failures: u32) -> u32 {
        failures.min(self.failure_cap)
    }
}
