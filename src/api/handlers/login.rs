//! `POST /auth/login`: one endpoint, three stage payloads.
//!
//! The `stage` field selects the variant explicitly; payloads are never
//! inferred from which keys happen to be present.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{attempt_context, AppState, FaceSampleBody};
use crate::biometrics::Pose;
use crate::error::AuthError;
use crate::ledger::{AttemptOutcome, AttemptStage, FailureReason};
use crate::login::{FacePresentation, FaceSample};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum LoginRequest {
    Credential {
        /// Username or DNI.
        identifier: String,
    },
    Face {
        session_id: String,
        sample: FaceSampleBody,
        /// Planar `{x, y, scale}` or angular `{roll, pitch, yaw, dist}`.
        #[schema(value_type = Object)]
        pose: Value,
        #[serde(default)]
        #[schema(value_type = Option<Object>)]
        image_metadata: Option<Value>,
    },
    Fallback {
        session_id: String,
        dni: String,
        code: String,
    },
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Stage accepted", body = LoginResponse),
        (status = 400, description = "Malformed payload"),
        (status = 401, description = "Authentication failed"),
        (status = 429, description = "Source blocked"),
        (status = 500, description = "Internal error"),
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let context = attempt_context(&headers, peer);
    let orchestrator = state.orchestrator();
    let Json(request) = match request {
        Ok(request) => request,
        Err(err) => {
            // The stage is unknown, so the record lands at the entry stage.
            orchestrator
                .ledger()
                .record(
                    context
                        .attempt(AttemptStage::Credential, AttemptOutcome::Failed)
                        .with_reason(FailureReason::InvalidCredential)
                        .with_details(json!({ "type": "malformed_request" })),
                )
                .await;
            return Err(AuthError::validation(err.body_text()));
        }
    };

    let response = match request {
        LoginRequest::Credential { identifier } => {
            let accepted = orchestrator.submit_credential(&context, &identifier).await?;
            LoginResponse {
                success: true,
                next_stage: accepted.next.next_stage().map(str::to_string),
                session_id: Some(accepted.session_id),
                user_id: Some(accepted.identity_id),
                ..LoginResponse::default()
            }
        }
        LoginRequest::Face {
            session_id,
            sample,
            pose,
            image_metadata,
        } => {
            // Undecodable images still pass the rate limiter first.
            let sample = sample.decode().unwrap_or(FaceSample::Unreadable);
            let accepted = orchestrator
                .submit_face(
                    &context,
                    FacePresentation {
                        session_id,
                        sample,
                        pose: Pose::from_value(&pose),
                        image_metadata,
                    },
                )
                .await?;
            LoginResponse {
                success: true,
                next_stage: accepted.next.next_stage().map(str::to_string),
                session_id: Some(accepted.session_id),
                confidence_score: accepted.confidence,
                attempt_id: accepted.attempt_id,
                processing_time: Some(accepted.processing_time.as_secs_f64()),
                ..LoginResponse::default()
            }
        }
        LoginRequest::Fallback {
            session_id,
            dni,
            code,
        } => {
            let done = orchestrator
                .submit_fallback(&context, &session_id, &dni, &code)
                .await?;
            LoginResponse {
                success: true,
                user_id: Some(done.identity_id),
                token: Some(done.token.token),
                expires_at: Some(done.token.expires_at),
                ..LoginResponse::default()
            }
        }
    };

    Ok(Json(response))
}
