//! Embedding extraction collaborator.
//!
//! Face detection and feature extraction run outside this service. The login
//! path only ever sees `Some(embedding)` or `None`: timeouts, transport errors
//! and malformed vectors all read as "no face detected".

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::biometrics::{Embedding, EmbeddingError};
use crate::APP_USER_AGENT;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extractor request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extractor responded with status {0}")]
    Status(u16),
    #[error("extractor returned an invalid embedding: {0}")]
    Malformed(#[from] EmbeddingError),
}

#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// `Ok(None)` when the image holds no usable face.
    async fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError>;
}

/// Used when no extractor endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExtractor;

#[async_trait]
impl EmbeddingExtractor for DisabledExtractor {
    async fn extract(&self, _image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    embedding: Option<Vec<f32>>,
}

/// Posts raw image bytes and expects `{"embedding": [..] | null}` back.
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: Client,
    endpoint: Url,
}

impl HttpExtractor {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingExtractor for HttpExtractor {
    #[instrument(skip(self, image), fields(endpoint = %self.endpoint, bytes = image.len()))]
    async fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExtractionError::Status(response.status().as_u16()));
        }

        let body: ExtractionResponse = response.json().await?;
        match body.embedding {
            Some(values) => Ok(Some(Embedding::new(values)?)),
            None => Ok(None),
        }
    }
}

/// Run `extractor` with a deadline, collapsing every failure into `None`.
pub async fn extract_with_timeout(
    extractor: &dyn EmbeddingExtractor,
    image: &[u8],
    timeout: Duration,
) -> Option<Embedding> {
    match tokio::time::timeout(timeout, extractor.extract(image)).await {
        Ok(Ok(Some(embedding))) => Some(embedding),
        Ok(Ok(None)) => {
            debug!("No face found in image");
            None
        }
        Ok(Err(err)) => {
            warn!("Embedding extraction failed: {err}");
            None
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis(), "Embedding extraction timed out");
            None
        }
    }
}
