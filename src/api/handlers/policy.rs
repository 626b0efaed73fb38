//! Recognition policy administration.
//!
//! Activating a policy stores it as a new version; older versions stay
//! listed but inactive.

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

use super::{AdminAuth, AppState};
use crate::error::AuthError;
use crate::policy::RecognitionPolicy;

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyView {
    pub success: bool,
    pub policy: RecognitionPolicy,
    /// `false` when no stored policy is active and defaults apply.
    pub active: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyList {
    pub success: bool,
    pub count: usize,
    pub policies: Vec<RecognitionPolicy>,
}

#[utoipa::path(
    get,
    path = "/policy",
    responses(
        (status = 200, description = "Policy in effect", body = PolicyView),
        (status = 401, description = "Missing or wrong admin token"),
    ),
    security(("bearer" = [])),
    tag = "policy"
)]
pub async fn current_policy(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, AuthError> {
    let stored = state
        .store()
        .active_policy()
        .await?
        .filter(|policy| policy.validate().is_ok());
    let view = match stored {
        Some(policy) => PolicyView {
            success: true,
            policy,
            active: true,
        },
        None => PolicyView {
            success: true,
            policy: RecognitionPolicy::default(),
            active: false,
        },
    };
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/policy",
    request_body = RecognitionPolicy,
    responses(
        (status = 201, description = "Policy activated", body = PolicyView),
        (status = 400, description = "Policy rejected"),
        (status = 401, description = "Missing or wrong admin token"),
    ),
    security(("bearer" = [])),
    tag = "policy"
)]
pub async fn activate_policy(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    request: Result<Json<RecognitionPolicy>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(mut policy) = request.map_err(|err| AuthError::validation(err.body_text()))?;
    policy.name = policy.name.trim().to_string();
    policy
        .validate()
        .map_err(|err| AuthError::validation(err.to_string()))?;

    let policy = state.store().activate_policy(&policy).await?;
    info!(version = policy.version, name = %policy.name, "Recognition policy activated");

    Ok((
        StatusCode::CREATED,
        Json(PolicyView {
            success: true,
            policy,
            active: true,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/policies",
    responses(
        (status = 200, description = "Stored policies, newest first", body = PolicyList),
        (status = 401, description = "Missing or wrong admin token"),
    ),
    security(("bearer" = [])),
    tag = "policy"
)]
pub async fn list_policies(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, AuthError> {
    let policies = state.store().list_policies().await?;
    Ok(Json(PolicyList {
        success: true,
        count: policies.len(),
        policies,
    }))
}
