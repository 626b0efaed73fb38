//! Shared fixtures: an in-memory store with one registered identity and a
//! scripted extractor.

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use facegate::{
    biometrics::{Embedding, PlanarPose, Pose, COMPARED_DIMENSIONS},
    extractor::{EmbeddingExtractor, ExtractionError},
    identity::{BiometricRegistration, Identity},
    login::{LoginConfig, LoginOrchestrator, SessionTokenIssuer},
    store::{MemoryStore, Store},
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const USERNAME: &str = "alice";
pub const DNI: &str = "12345678";
pub const CODE: &str = "4321";
pub const PEPPER: &[u8] = b"fixture pepper";

/// Vector of zeros with `first` in dimension 0; distances to the enrolled
/// template therefore equal `first`.
pub fn vector(first: f32) -> Vec<f32> {
    let mut values = vec![0.0_f32; COMPARED_DIMENSIONS];
    values[0] = first;
    values
}

pub fn enrolled_pose() -> Pose {
    Pose::Planar(PlanarPose {
        x: 0.5,
        y: 0.5,
        scale: 1.0,
    })
}

/// Images are plain text: `face:<first>` yields `vector(first)`, anything
/// else holds no face.
pub struct ScriptedExtractor;

#[async_trait]
impl EmbeddingExtractor for ScriptedExtractor {
    async fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
        let first = std::str::from_utf8(image)
            .ok()
            .and_then(|text| text.strip_prefix("face:"))
            .and_then(|value| value.parse::<f32>().ok());
        match first {
            Some(first) => Ok(Some(Embedding::new(vector(first))?)),
            None => Ok(None),
        }
    }
}

pub struct Fixture {
    pub store: MemoryStore,
    pub orchestrator: LoginOrchestrator,
    pub identity_id: Uuid,
}

/// Store with `alice` enrolled (zero template, centred pose, code 4321).
pub async fn fixture() -> Result<Fixture> {
    let store = MemoryStore::new();
    let config = LoginConfig::default()
        .with_extractor_timeout(Duration::from_millis(500))
        .with_code_pepper(PEPPER);
    let identity = Identity::new(USERNAME, DNI);
    let identity_id = identity.id;
    store.insert_identity(&identity).await?;
    store
        .register_biometrics(
            identity_id,
            &BiometricRegistration {
                embeddings: vec![Embedding::new(vector(0.0))?],
                poses: vec![enrolled_pose()],
                fallback_code_hash: Some(config.codes().hash(CODE)?),
            },
        )
        .await?
        .context("identity vanished during enrolment")?;

    let orchestrator = LoginOrchestrator::new(
        Arc::new(store.clone()),
        Arc::new(ScriptedExtractor),
        Arc::new(SessionTokenIssuer::new(3600)),
        config,
    );

    Ok(Fixture {
        store,
        orchestrator,
        identity_id,
    })
}
