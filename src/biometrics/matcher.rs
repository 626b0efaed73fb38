//! Adaptive embedding matcher.
//!
//! The acceptance threshold is a distance ceiling that grows with the
//! identity's failure count (bounded by the policy ceiling). The stored
//! collection is scanned in order and the first embedding strictly below the
//! threshold wins; no search for the best candidate is made.

use crate::identity::FaceTemplates;
use crate::policy::RecognitionPolicy;

use super::embedding::Embedding;

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Euclidean,
    /// Single pre-collection vector compared by cosine similarity.
    LegacyCosine,
    /// Nothing to compare against, or no live embedding.
    Unavailable,
}

impl MatchMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Euclidean => "euclidean",
            Self::LegacyCosine => "legacy_cosine",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    pub matched: bool,
    pub method: MatchMethod,
    /// Distance threshold (Euclidean) or similarity bar (legacy).
    pub threshold: f64,
    /// Distance of the accepted embedding, or the closest seen on rejection.
    pub distance: Option<f64>,
    pub similarity: Option<f64>,
    pub comparisons: usize,
}

impl MatchReport {
    /// Confidence in `[0, 1]` for an accepted match.
    #[must_use]
    pub fn confidence(&self) -> Option<f64> {
        if !self.matched {
            return None;
        }
        match self.method {
            MatchMethod::Euclidean => self.distance.map(|distance| {
                if self.threshold > 0.0 {
                    (1.0 - distance / self.threshold).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }),
            MatchMethod::LegacyCosine => self.similarity.map(|value| value.clamp(0.0, 1.0)),
            MatchMethod::Unavailable => None,
        }
    }
}

/// Stateless; safe to share across concurrent requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveMatcher;

impl AdaptiveMatcher {
    /// Effective distance threshold for a failure count.
    #[must_use]
    pub fn threshold(policy: &RecognitionPolicy, failures: u32) -> f64 {
        policy
            .distance_threshold
            .at(policy.cap_failures(failures))
    }

    /// Fails closed: no templates or no live embedding yields `false`.
    #[must_use]
    pub fn matches(
        &self,
        policy: &RecognitionPolicy,
        templates: &FaceTemplates,
        live: Option<&Embedding>,
        failures: u32,
    ) -> bool {
        self.evaluate(policy, templates, live, failures).matched
    }

    #[must_use]
    pub fn evaluate(
        &self,
        policy: &RecognitionPolicy,
        templates: &FaceTemplates,
        live: Option<&Embedding>,
        failures: u32,
    ) -> MatchReport {
        let threshold = Self::threshold(policy, failures);
        let unavailable = MatchReport {
            matched: false,
            method: MatchMethod::Unavailable,
            threshold,
            distance: None,
            similarity: None,
            comparisons: 0,
        };

        let Some(live) = live else {
            return unavailable;
        };

        match templates {
            FaceTemplates::Collection(stored) if stored.is_empty() => unavailable,
            FaceTemplates::Collection(stored) => first_below(stored, live, threshold),
            FaceTemplates::Legacy(stored) => {
                let similarity = stored.cosine_similarity(live);
                MatchReport {
                    matched: similarity >= policy.legacy_cosine_min,
                    method: MatchMethod::LegacyCosine,
                    threshold: policy.legacy_cosine_min,
                    distance: None,
                    similarity: Some(similarity),
                    comparisons: 1,
                }
            }
        }
    }
}

fn first_below(stored: &[Embedding], live: &Embedding, threshold: f64) -> MatchReport {
    let mut closest: Option<f64> = None;
    let mut comparisons = 0;

    for candidate in stored {
        comparisons += 1;
        let distance = candidate.euclidean_distance(live);
        if distance < threshold {
            return MatchReport {
                matched: true,
                method: MatchMethod::Euclidean,
                threshold,
                distance: Some(distance),
                similarity: None,
                comparisons,
            };
        }
        closest = Some(closest.map_or(distance, |best| best.min(distance)));
    }

    MatchReport {
        matched: false,
        method: MatchMethod::Euclidean,
        threshold,
        distance: closest,
        similarity: None,
        comparisons,
    }
}
