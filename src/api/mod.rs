// =============================================================================
// API module — REST endpoints, WebSocket fan-out, authentication
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::types::EngineError;

/// Every caller-visible error becomes `{"error": message, "code": CODE}` with
/// the status the error kind maps to.
impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}
