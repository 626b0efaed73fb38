//! API handlers and shared request helpers.
//!
//! Handlers receive the shared [`AppState`] through an `Extension` layer.
//! Administrative routes take an [`AdminAuth`] extractor that checks the
//! bearer token before the handler body runs.

pub mod attempts;
pub mod blocks;
pub mod health;
pub mod login;
pub mod policy;
pub mod users;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::AUTHORIZATION, header::USER_AGENT, request::Parts, HeaderMap},
};
use base64ct::{Base64, Encoding};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use subtle::ConstantTimeEq;
use tracing::warn;
use utoipa::ToSchema;

use crate::biometrics::Embedding;
use crate::error::AuthError;
use crate::extractor::extract_with_timeout;
use crate::ledger::AttemptContext;
use crate::login::{hash_token, FaceSample, LoginOrchestrator};
use crate::store::Store;

const UNKNOWN_SOURCE: &str = "unknown";

pub struct AppState {
    store: Arc<dyn Store>,
    orchestrator: LoginOrchestrator,
    admin_token_hash: Vec<u8>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, orchestrator: LoginOrchestrator, admin_token: &str) -> Self {
        Self {
            store,
            orchestrator,
            admin_token_hash: hash_token(admin_token),
        }
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    #[must_use]
    pub fn orchestrator(&self) -> &LoginOrchestrator {
        &self.orchestrator
    }

    fn admin_token_matches(&self, presented: &str) -> bool {
        bool::from(hash_token(presented).ct_eq(&self.admin_token_hash))
    }
}

/// Face sample as sent by clients: `{"image": "<base64>"}` or `{"embedding": [..]}`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FaceSampleBody {
    Image(String),
    Embedding(Vec<f32>),
}

impl FaceSampleBody {
    /// # Errors
    /// Returns a validation error for undecodable images.
    pub fn decode(self) -> Result<FaceSample, AuthError> {
        match self {
            Self::Image(encoded) => Base64::decode_vec(encoded.trim())
                .map(FaceSample::Image)
                .map_err(|_| AuthError::validation("Invalid base64 image")),
            Self::Embedding(values) => Ok(FaceSample::Embedding(values)),
        }
    }
}

/// Turn a registration sample into a stored embedding.
async fn sample_embedding(
    state: &AppState,
    sample: FaceSample,
    index: usize,
) -> Result<Embedding, AuthError> {
    match sample {
        FaceSample::Image(bytes) => {
            let orchestrator = state.orchestrator();
            extract_with_timeout(
                orchestrator.extractor(),
                &bytes,
                orchestrator.config().extractor_timeout(),
            )
            .await
            .ok_or_else(|| AuthError::validation(format!("No face detected in sample {index}")))
        }
        FaceSample::Embedding(values) => Embedding::new(values)
            .map_err(|err| AuthError::validation(format!("Sample {index}: {err}"))),
        FaceSample::Unreadable => Err(AuthError::validation(format!(
            "Sample {index}: unreadable image"
        ))),
    }
}

/// Client address from proxy headers, then the socket peer.
pub(crate) fn client_source(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(forwarded) = forwarded {
        return forwarded.to_string();
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

pub(crate) fn attempt_context(
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> AttemptContext {
    AttemptContext {
        source: client_source(headers, peer.map(|ConnectInfo(addr)| addr)),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        session_id: None,
    }
}

/// Proof that the request carried the admin bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[async_trait]
impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(state) = parts.extensions.get::<Arc<AppState>>() else {
            return Err(AuthError::Internal("application state missing".to_string()));
        };

        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        match presented {
            Some(token) if state.admin_token_matches(token) => Ok(Self),
            _ => {
                warn!(path = %parts.uri.path(), "Rejected admin request");
                Err(AuthError::AuthenticationFailed)
            }
        }
    }
}
