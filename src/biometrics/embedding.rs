//! Face embeddings and the distance metrics used to compare them.

use serde::{Deserialize, Serialize};

/// Number of leading dimensions that take part in comparisons. Extractors may
/// append auxiliary values after these; they are carried but ignored.
pub const COMPARED_DIMENSIONS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding has {found} dimensions, at least {COMPARED_DIMENSIONS} required")]
    TooShort { found: usize },
    #[error("embedding value at index {index} is not finite")]
    NotFinite { index: usize },
}

/// Fixed-length face vector produced by the extraction collaborator.
///
/// Construction validates length and finiteness, so a held `Embedding` is
/// always comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// # Errors
    /// Returns `EmbeddingError` when the vector is shorter than
    /// [`COMPARED_DIMENSIONS`] or holds `NaN`/infinite values.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() < COMPARED_DIMENSIONS {
            return Err(EmbeddingError::TooShort {
                found: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(EmbeddingError::NotFinite { index });
        }
        Ok(Self(values))
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn compared(&self) -> &[f32] {
        &self.0[..COMPARED_DIMENSIONS]
    }

    /// Euclidean distance over the compared dimensions.
    #[must_use]
    pub fn euclidean_distance(&self, other: &Self) -> f64 {
        self.compared()
            .iter()
            .zip(other.compared())
            .map(|(lhs, rhs)| {
                let delta = f64::from(*lhs) - f64::from(*rhs);
                delta * delta
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Cosine similarity over the compared dimensions; zero vectors yield 0.
    #[must_use]
    pub fn cosine_similarity(&self, other: &Self) -> f64 {
        let mut dot = 0.0;
        let mut norm_lhs = 0.0;
        let mut norm_rhs = 0.0;

        for (lhs, rhs) in self.compared().iter().zip(other.compared()) {
            let (lhs, rhs) = (f64::from(*lhs), f64::from(*rhs));
            dot += lhs * rhs;
            norm_lhs += lhs * lhs;
            norm_rhs += rhs * rhs;
        }

        let norm = norm_lhs.sqrt() * norm_rhs.sqrt();
        if norm == 0.0 {
            return 0.0;
        }
        dot / norm
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}
