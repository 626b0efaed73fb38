//! Request-level error taxonomy.
//!
//! Every failed login stage or admin call ends in exactly one `AuthError`, which
//! maps onto a single HTTP status. Authentication failures are deliberately
//! generic: the body never says whether the face, the pose or the code was wrong.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::error;

use crate::limiter::BlockReason;
use crate::store::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited until {blocked_until:?} ({reason})")]
    RateLimited {
        /// `None` for permanent blocks.
        blocked_until: Option<DateTime<Utc>>,
        reason: BlockReason,
    },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Validation(message) | Self::NotFound(message) | Self::Conflict(message) => {
                json!({ "success": false, "error": message })
            }
            Self::RateLimited {
                blocked_until,
                reason,
            } => json!({
                "success": false,
                "error": "Too many attempts",
                "blocked": true,
                "blocked_until": blocked_until.map(|until| until.to_rfc3339()),
                "reason": reason.as_str(),
            }),
            Self::AuthenticationFailed => {
                json!({ "success": false, "error": "Authentication failed" })
            }
            Self::Storage(err) => {
                error!("Storage failure while handling request: {err}");
                json!({ "success": false, "error": "Internal error" })
            }
            Self::Internal(message) => {
                error!("Internal failure while handling request: {message}");
                json!({ "success": false, "error": "Internal error" })
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            AuthError::validation("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AuthError::RateLimited {
                blocked_until: None,
                reason: BlockReason::TooManyAttempts,
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AuthError::AuthenticationFailed.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Storage(StorageError::Unavailable("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn rate_limited_body_carries_block_metadata() -> Result<()> {
        let until = Utc::now();
        let response = AuthError::RateLimited {
            blocked_until: Some(until),
            reason: BlockReason::TooManyAttempts,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(value["blocked"], true);
        assert_eq!(value["reason"], "too_many_attempts");
        assert_eq!(value["blocked_until"], until.to_rfc3339());
        Ok(())
    }

    #[tokio::test]
    async fn authentication_failure_is_generic() -> Result<()> {
        let response = AuthError::AuthenticationFailed.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(value["error"], "Authentication failed");
        assert!(value.get("reason").is_none());
        Ok(())
    }
}
