//! Biometric comparison core: embeddings, the adaptive matcher and the pose
//! validator. Everything here is pure and reentrant.

pub mod embedding;
pub mod matcher;
pub mod pose;

pub use embedding::{Embedding, EmbeddingError, COMPARED_DIMENSIONS};
pub use matcher::{AdaptiveMatcher, MatchMethod, MatchReport};
pub use pose::{AngularPose, PlanarPose, Pose, PoseReport, PoseSchema, PoseTolerances, PoseValidator};
