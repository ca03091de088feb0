use crate::response::{status_deleted, ApiResponse};
use crate::validation::{require_field, validate_cache_name};
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
pub struct CreateCacheRequest {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheCreated {
    pub name: String,
    pub path: DatasetPath,
}

/// GET /caches
pub async fn list_caches(State(state): State<Arc<AppState>>) -> Result<Response> {
    let caches: Vec<String> = state
        .manager
        .list_caches()
        .await?
        .into_iter()
        .map(String::from)
        .collect();

    Ok(ApiResponse::ok(caches).into_response())
}

/// POST /caches
pub async fn create_cache(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CreateCacheRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(req) = body?;
    let name = require_field("name", req.name)?;
    validate_cache_name(&name)?;

    info!("Creating cache: {}", name);
    let path = state.manager.create_cache(&name).await?;

    Ok(ApiResponse::ok(CacheCreated { name, path }).into_response())
}

/// GET /caches/{name}
pub async fn get_cache(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    validate_cache_name(&name)?;

    let row = state.manager.exists_cache(&name).await?.ok_or_else(|| {
        let path = state
            .manager
            .naming()
            .cache_path(&name)
            .map(String::from)
            .unwrap_or_else(|_| name.clone());
        ApiError::from(ForkpoolError::not_found("Cache", path))
    })?;

    Ok(ApiResponse::ok(row).into_response())
}

/// DELETE /caches/{name}
pub async fn delete_cache(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    validate_cache_name(&name)?;

    info!("Destroying cache: {}", name);
    state.manager.destroy_cache(&name).await?;

    Ok(status_deleted("Cache", &name))
}
