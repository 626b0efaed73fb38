//! Blocklist administration.

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{AdminAuth, AppState};
use crate::error::AuthError;
use crate::limiter::{BlockEntry, BlockReason, ManualBlock};
use crate::policy::RecognitionPolicy;

/// A year of minutes; longer blocks should be permanent.
const MAX_BLOCK_MINUTES: u32 = 525_600;

#[derive(Debug, Serialize, ToSchema)]
pub struct BlockView {
    #[serde(flatten)]
    pub entry: BlockEntry,
    pub currently_blocked: bool,
}

impl From<BlockEntry> for BlockView {
    fn from(entry: BlockEntry) -> Self {
        Self {
            currently_blocked: entry.is_currently_blocked(),
            entry,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BlockList {
    pub success: bool,
    pub count: usize,
    pub blocks: Vec<BlockView>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct BlockRequest {
    pub source: String,
    pub reason: Option<BlockReason>,
    /// Defaults to the active policy's block duration.
    pub minutes: Option<u32>,
    #[serde(default)]
    pub permanent: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BlockCreated {
    pub success: bool,
    pub block: BlockView,
}

#[utoipa::path(
    get,
    path = "/blocks",
    responses(
        (status = 200, description = "Blocklist entries", body = BlockList),
        (status = 401, description = "Missing or wrong admin token"),
    ),
    security(("bearer" = [])),
    tag = "blocks"
)]
pub async fn list_blocks(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, AuthError> {
    let blocks: Vec<BlockView> = state
        .orchestrator()
        .limiter()
        .list()
        .await?
        .into_iter()
        .map(BlockView::from)
        .collect();

    Ok(Json(BlockList {
        success: true,
        count: blocks.len(),
        blocks,
    }))
}

#[utoipa::path(
    post,
    path = "/blocks",
    request_body = BlockRequest,
    responses(
        (status = 201, description = "Source blocked", body = BlockCreated),
        (status = 400, description = "Invalid source or duration"),
        (status = 401, description = "Missing or wrong admin token"),
    ),
    security(("bearer" = [])),
    tag = "blocks"
)]
pub async fn create_block(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    request: Result<Json<BlockRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(request) = request.map_err(|err| AuthError::validation(err.body_text()))?;

    let source = request.source.trim();
    if source.is_empty() {
        return Err(AuthError::validation("Source must not be empty"));
    }
    let duration = match request.minutes {
        None => None,
        Some(minutes) if (1..=MAX_BLOCK_MINUTES).contains(&minutes) => {
            Some(ChronoDuration::minutes(i64::from(minutes)))
        }
        Some(_) => {
            return Err(AuthError::validation(format!(
                "minutes must be between 1 and {MAX_BLOCK_MINUTES}"
            )))
        }
    };

    let policy = RecognitionPolicy::resolve(state.store()).await;
    let entry = state
        .orchestrator()
        .limiter()
        .block(
            source,
            &policy,
            ManualBlock {
                reason: request.reason.unwrap_or(BlockReason::ManualBlock),
                duration,
                permanent: request.permanent,
                notes: request.notes,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(BlockCreated {
            success: true,
            block: entry.into(),
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/blocks/{source}",
    params(("source" = String, Path, description = "Blocked source address")),
    responses(
        (status = 204, description = "Entry removed"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "No entry for source"),
    ),
    security(("bearer" = [])),
    tag = "blocks"
)]
pub async fn delete_block(
    _admin: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
    Path(source): Path<String>,
) -> Result<impl IntoResponse, AuthError> {
    if state.orchestrator().limiter().unblock(&source).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthError::NotFound(format!("No block for {source}")))
    }
}
