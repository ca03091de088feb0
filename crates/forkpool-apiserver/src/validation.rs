use crate::{ApiError, Result};
use forkpool_core::validate_identifier;

/// Unwrap a required string field of a request body
pub fn require_field(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("{} is required", field))),
    }
}

pub fn validate_cache_name(name: &str) -> Result<()> {
    validate_identifier("cache name", name).map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub fn validate_branch_id(sha: &str) -> Result<()> {
    validate_identifier("branch identifier", sha).map_err(|e| ApiError::BadRequest(e.to_string()))
}
