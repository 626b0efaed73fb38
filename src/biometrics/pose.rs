//! Head pose records and the adaptive pose validator.
//!
//! Two schemas exist and never mix: planar `{x, y, scale}` and angular
//! `{roll, pitch, yaw, dist}`. A stored pose is only compared with a live
//! pose of the same schema. Tolerances shrink as failures accumulate, the
//! opposite direction of the embedding threshold.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::policy::RecognitionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PlanarPose {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AngularPose {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub dist: f64,
}

/// Serialized flat, exactly as clients send it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Pose {
    Planar(PlanarPose),
    Angular(AngularPose),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseSchema {
    Planar,
    Angular,
}

impl PoseSchema {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planar => "planar",
            Self::Angular => "angular",
        }
    }
}

fn number(object: &Map<String, Value>, key: &str) -> Option<f64> {
    object
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
}

impl Pose {
    /// Read a flat pose record, detecting the schema by key presence.
    ///
    /// Planar wins when an object carries both key sets. Returns `None` when
    /// neither schema is complete.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        if let (Some(x), Some(y), Some(scale)) = (
            number(object, "x"),
            number(object, "y"),
            number(object, "scale"),
        ) {
            return Some(Self::Planar(PlanarPose { x, y, scale }));
        }

        if let (Some(roll), Some(pitch), Some(yaw), Some(dist)) = (
            number(object, "roll"),
            number(object, "pitch"),
            number(object, "yaw"),
            number(object, "dist"),
        ) {
            return Some(Self::Angular(AngularPose {
                roll,
                pitch,
                yaw,
                dist,
            }));
        }

        None
    }

    #[must_use]
    pub const fn schema(&self) -> PoseSchema {
        match self {
            Self::Planar(_) => PoseSchema::Planar,
            Self::Angular(_) => PoseSchema::Angular,
        }
    }
}

/// Tolerances in effect for one failure count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseTolerances {
    pub xy: f64,
    pub scale: f64,
    pub degrees: f64,
    pub dist: f64,
}

impl PoseTolerances {
    #[must_use]
    pub fn for_failures(policy: &RecognitionPolicy, failures: u32) -> Self {
        let failures = policy.cap_failures(failures);
        Self {
            xy: policy.planar_xy_tolerance.at(failures),
            scale: policy.planar_scale_tolerance.at(failures),
            degrees: policy.angular_degrees_tolerance.at(failures),
            dist: policy.angular_distance_tolerance.at(failures),
        }
    }

    fn accepts(&self, stored: &Pose, live: &Pose) -> bool {
        match (stored, live) {
            (Pose::Planar(stored), Pose::Planar(live)) => {
                (stored.x - live.x).abs() <= self.xy
                    && (stored.y - live.y).abs() <= self.xy
                    && (stored.scale - live.scale).abs() <= self.scale
            }
            (Pose::Angular(stored), Pose::Angular(live)) => {
                (stored.roll - live.roll).abs() <= self.degrees
                    && (stored.pitch - live.pitch).abs() <= self.degrees
                    && (stored.yaw - live.yaw).abs() <= self.degrees
                    && (stored.dist - live.dist).abs() <= self.dist
            }
            _ => false,
        }
    }
}

/// Outcome of one pose validation, kept for the attempt's detection details.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseReport {
    pub valid: bool,
    pub schema: Option<PoseSchema>,
    pub tolerances: PoseTolerances,
    pub compared: usize,
}

/// Stateless; safe to share across concurrent requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseValidator;

impl PoseValidator {
    #[must_use]
    pub fn validate(
        &self,
        policy: &RecognitionPolicy,
        stored: &[Pose],
        live: Option<&Pose>,
        failures: u32,
    ) -> bool {
        self.evaluate(policy, stored, live, failures).valid
    }

    #[must_use]
    pub fn evaluate(
        &self,
        policy: &RecognitionPolicy,
        stored: &[Pose],
        live: Option<&Pose>,
        failures: u32,
    ) -> PoseReport {
        let tolerances = PoseTolerances::for_failures(policy, failures);
        let Some(live) = live else {
            return PoseReport {
                valid: false,
                schema: None,
                tolerances,
                compared: 0,
            };
        };

        let mut compared = 0;
        let mut valid = false;
        for pose in stored.iter().filter(|pose| pose.schema() == live.schema()) {
            compared += 1;
            if tolerances.accepts(pose, live) {
                valid = true;
                break;
            }
        }

        PoseReport {
            valid,
            schema: Some(live.schema()),
            tolerances,
            compared,
        }
    }
}
