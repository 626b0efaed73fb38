use axum::{
    extract::{Extension, Query},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use super::{AdminAuth, AppState};
use crate::error::AuthError;
use crate::ledger::{AttemptOutcome, AttemptRecord};
use crate::store::AttemptFilter;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AttemptQuery {
    /// Username or DNI.
    pub username: Option<String>,
    /// `success`, `failed`, `blocked` or `error`.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl AttemptQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AttemptList {
    pub success: bool,
    pub count: usize,
    pub attempts: Vec<AttemptRecord>,
}

#[utoipa::path(
    get,
    path = "/attempts",
    params(AttemptQuery),
    responses(
        (status = 200, description = "Attempts, newest first", body = AttemptList),
        (status = 400, description = "Unknown status"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "Unknown username"),
    ),
    security(("bearer" = [])),
    tag = "attempts"
)]
pub async fn list_attempts(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AttemptQuery>,
) -> Result<impl IntoResponse, AuthError> {
    let outcome = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(status) => Some(
            AttemptOutcome::parse(status)
                .ok_or_else(|| AuthError::validation(format!("Unknown status: {status}")))?,
        ),
    };

    let identity_id = match query.username.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(key) => {
            let identity = state
                .store()
                .find_identity_by_key(key)
                .await?
                .ok_or_else(|| AuthError::NotFound(format!("User {key} not found")))?;
            Some(identity.id)
        }
    };

    let filter = AttemptFilter {
        identity_id,
        source: None,
        outcome,
        limit: query.limit(),
    };
    let attempts = state.orchestrator().ledger().list(&filter).await?;

    Ok(Json(AttemptList {
        success: true,
        count: attempts.len(),
        attempts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(AttemptQuery::default().limit(), DEFAULT_LIMIT);
        let query = AttemptQuery {
            limit: Some(10_000),
            ..AttemptQuery::default()
        };
        assert_eq!(query.limit(), MAX_LIMIT);
        let query = AttemptQuery {
            limit: Some(0),
            ..AttemptQuery::default()
        };
        assert_eq!(query.limit(), 1);
    }
}
