use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// API response wrapper
pub struct ApiResponse<T: Serialize> {
    status: StatusCode,
    body: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a new response with 200 OK
    pub fn ok(body: T) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Success Status response
pub fn status_success(message: &str) -> Response {
    Json(json!({
        "status": "Success",
        "message": message,
        "code": 200
    }))
    .into_response()
}

/// Deletion Status response
pub fn status_deleted(kind: &str, path: &str) -> Response {
    status_success(&format!("{} {} destroyed", kind, path))
}
