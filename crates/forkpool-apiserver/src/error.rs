use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forkpool_core::ForkpoolError;
use serde_json::json;
use tracing::error;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    /// Invalid or missing input, rejected before reaching the manager (400)
    BadRequest(String),

    /// Failure reported by the manager; status follows the error kind
    Manager(ForkpoolError),
}

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Manager(err) => match err {
                ForkpoolError::Validation { .. } => StatusCode::BAD_REQUEST,
                ForkpoolError::NotFound { .. } => StatusCode::NOT_FOUND,
                ForkpoolError::AlreadyExists { .. } | ForkpoolError::BranchesExist { .. } => {
                    StatusCode::CONFLICT
                }
                ForkpoolError::Engine { .. } => StatusCode::BAD_GATEWAY,
                ForkpoolError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ForkpoolError::InconsistentState { .. }
                | ForkpoolError::Parse { .. }
                | ForkpoolError::Journal { .. }
                | ForkpoolError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "ValidationError",
            ApiError::Manager(err) => err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        let (message, operation, path) = match self {
            ApiError::BadRequest(msg) => (msg, None, None),
            ApiError::Manager(err) => {
                if matches!(err, ForkpoolError::InconsistentState { .. }) {
                    error!("Operator intervention required: {}", err);
                }
                (
                    err.to_string(),
                    err.operation().map(|op| op.as_str()),
                    err.path().map(str::to_string),
                )
            }
        };

        let body = Json(json!({
            "status": "Failure",
            "kind": kind,
            "message": message,
            "operation": operation,
            "path": path,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<ForkpoolError> for ApiError {
    fn from(err: ForkpoolError) -> Self {
        ApiError::Manager(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
