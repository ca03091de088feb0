use crate::response::{status_deleted, ApiResponse};
use crate::validation::{require_field, validate_branch_id, validate_cache_name};
use crate::{ApiError, AppState, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forkpool_core::{DatasetPath, ForkpoolError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub sha: Option<String>,
    pub parent_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ExportUpdated {
    pub path: DatasetPath,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct PromotionResumed {
    pub cache: DatasetPath,
}

fn validate_path(name: &str, sha: &str) -> Result<()> {
    validate_cache_name(name)?;
    validate_branch_id(sha)
}

/// GET /caches/{name}/branches
pub async fn list_branches(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    validate_cache_name(&name)?;

    let branches: Vec<String> = state
        .manager
        .list_branches(&name)
        .await?
        .iter()
        .map(|row| row.path.name().to_string())
        .collect();

    Ok(ApiResponse::ok(branches).into_response())
}

/// POST /caches/{name}/branches
pub async fn create_branch(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: std::result::Result<Json<CreateBranchRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(req) = body?;
    validate_cache_name(&name)?;
    let sha = require_field("sha", req.sha)?;
    validate_branch_id(&sha)?;
    let parent = match req.parent_sha {
        Some(parent) if !parent.is_empty() => {
            validate_branch_id(&parent)?;
            Some(parent)
        }
        _ => None,
    };

    info!(
        "Creating branch {} of cache {} (parent: {})",
        sha,
        name,
        parent.as_deref().unwrap_or("-")
    );
    let created = state
        .manager
        .create_branch(&name, &sha, parent.as_deref())
        .await?;

    Ok(ApiResponse::ok(created).into_response())
}

/// GET /caches/{name}/branches/{sha}
pub async fn get_branch(
    State(state): State<Arc<AppState>>,
    Path((name, sha)): Path<(String, String)>,
) -> Result<Response> {
    validate_path(&name, &sha)?;

    let row = state
        .manager
        .exists_branch(&name, &sha)
        .await?
        .ok_or_else(|| {
            ApiError::from(ForkpoolError::not_found(
                "Branch",
                format!("{}/{}", name, sha),
            ))
        })?;

    Ok(ApiResponse::ok(row).into_response())
}

/// DELETE /caches/{name}/branches/{sha}
pub async fn delete_branch(
    State(state): State<Arc<AppState>>,
    Path((name, sha)): Path<(String, String)>,
) -> Result<Response> {
    validate_path(&name, &sha)?;

    info!("Destroying branch {} of cache {}", sha, name);
    state.manager.destroy_branch(&name, &sha).await?;

    Ok(status_deleted("Branch", &sha))
}

/// POST /caches/{name}/branches/{sha}/promote
pub async fn promote_branch(
    State(state): State<Arc<AppState>>,
    Path((name, sha)): Path<(String, String)>,
) -> Result<Response> {
    validate_path(&name, &sha)?;

    info!("Promoting branch {} into cache {}", sha, name);
    let outcome = state.manager.promote_branch(&name, &sha).await?;

    Ok(ApiResponse::ok(outcome).into_response())
}

/// POST /caches/{name}/branches/{sha}/promote/resume
pub async fn resume_promotion(
    State(state): State<Arc<AppState>>,
    Path((name, sha)): Path<(String, String)>,
) -> Result<Response> {
    validate_path(&name, &sha)?;

    info!("Resuming promotion of {} into cache {}", sha, name);
    let cache = state.manager.resume_promotion(&name, &sha).await?;

    Ok(ApiResponse::ok(PromotionResumed { cache }).into_response())
}

/// PUT /caches/{name}/branches/{sha}/export
pub async fn set_export(
    State(state): State<Arc<AppState>>,
    Path((name, sha)): Path<(String, String)>,
    body: std::result::Result<Json<ExportRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(req) = body?;
    validate_path(&name, &sha)?;
    let enabled = req
        .enabled
        .ok_or_else(|| ApiError::BadRequest("enabled is required".to_string()))?;

    let path = state.manager.set_export(&name, &sha, enabled).await?;

    Ok(ApiResponse::ok(ExportUpdated { path, enabled }).into_response())
}
