//! Identity administration: creation and biometric registration.
//!
//! Flow Overview:
//! 1) Check the admin bearer token.
//! 2) Validate every sample, pose and code before touching the store.
//! 3) Append the registration to the identity in a single write.

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{sample_embedding, AdminAuth, AppState, FaceSampleBody};
use crate::biometrics::Pose;
use crate::error::AuthError;
use crate::identity::{
    normalize_username, valid_dni, valid_fallback_code, valid_username, BiometricRegistration,
    Identity, IdentityStatus,
};
use crate::store::StorageError;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub username: String,
    pub dni: String,
    pub status: Option<IdentityStatus>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateUserResponse {
    pub success: bool,
    pub user_id: Uuid,
    pub username: String,
    pub status: IdentityStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct FacialRegisterRequest {
    #[serde(default)]
    pub samples: Vec<FaceSampleBody>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub positions: Vec<Value>,
    pub fallback_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FacialRegisterResponse {
    pub success: bool,
    pub user_id: Uuid,
    /// Embeddings stored after this registration.
    pub embeddings: usize,
    /// Poses stored after this registration.
    pub positions: usize,
}

#[utoipa::path(
    post,
    path = "/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Identity created", body = CreateUserResponse),
        (status = 400, description = "Invalid username or DNI"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 409, description = "Username or DNI already registered"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn create_user(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    request: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(request) = request.map_err(|err| AuthError::validation(err.body_text()))?;

    let username = normalize_username(&request.username);
    if !valid_username(&username) {
        return Err(AuthError::validation("Invalid username"));
    }
    let dni = request.dni.trim();
    if !valid_dni(dni) {
        return Err(AuthError::validation("Invalid DNI"));
    }

    let mut identity = Identity::new(&username, dni);
    if let Some(status) = request.status {
        identity.status = status;
    }

    match state.store().insert_identity(&identity).await {
        Ok(()) => {}
        Err(StorageError::Conflict(message)) => return Err(AuthError::Conflict(message)),
        Err(err) => return Err(err.into()),
    }
    info!(user_id = %identity.id, "Identity created");

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            success: true,
            user_id: identity.id,
            username: identity.username,
            status: identity.status,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/users/{id}/facial-register",
    params(("id" = Uuid, Path, description = "Identity id")),
    request_body = FacialRegisterRequest,
    responses(
        (status = 201, description = "Biometrics appended", body = FacialRegisterResponse),
        (status = 400, description = "Invalid sample, pose or code"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "Unknown identity"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn facial_register(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    request: Result<Json<FacialRegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(request) = request.map_err(|err| AuthError::validation(err.body_text()))?;

    if state.store().find_identity(id).await?.is_none() {
        return Err(AuthError::NotFound(format!("User {id} not found")));
    }

    let mut registration = BiometricRegistration::default();
    for (index, sample) in request.samples.into_iter().enumerate() {
        let sample = sample.decode()?;
        registration
            .embeddings
            .push(sample_embedding(&state, sample, index).await?);
    }
    for (index, position) in request.positions.iter().enumerate() {
        let pose = Pose::from_value(position)
            .ok_or_else(|| AuthError::validation(format!("Unreadable position {index}")))?;
        registration.poses.push(pose);
    }
    if let Some(code) = request.fallback_code.as_deref().map(str::trim) {
        if !valid_fallback_code(code) {
            return Err(AuthError::validation("Fallback code must be 4 to 12 digits"));
        }
        let hash = state
            .orchestrator()
            .config()
            .codes()
            .hash(code)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        registration.fallback_code_hash = Some(hash);
    }
    if registration.is_empty() {
        return Err(AuthError::validation("Nothing to register"));
    }

    let identity = state
        .store()
        .register_biometrics(id, &registration)
        .await?
        .ok_or_else(|| AuthError::NotFound(format!("User {id} not found")))?;
    info!(
        user_id = %id,
        embeddings = registration.embeddings.len(),
        positions = registration.poses.len(),
        "Biometrics registered"
    );

    Ok((
        StatusCode::CREATED,
        Json(FacialRegisterResponse {
            success: true,
            user_id: id,
            embeddings: identity.templates.len(),
            positions: identity.poses.len(),
        }),
    ))
}
