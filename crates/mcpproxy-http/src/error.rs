//! Maps `McpProxyError` onto HTTP status codes and a JSON error body that
//! always carries `request_id` (spec §6). The message is always
//! `McpProxyError::sanitize()`'d — never the raw `Display`, which may
//! embed upstream URLs or stdio command lines.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpproxy_core::McpProxyError;

pub struct ApiError {
    status: StatusCode,
    message: String,
    request_id: String,
}

impl ApiError {
    pub fn new(error: McpProxyError, request_id: impl Into<String>) -> Self {
        let status = status_for(&error);
        Self {
            status,
            message: error.sanitize(),
            request_id: request_id.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    pub fn unauthorized(request_id: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid API key".to_string(),
            request_id: request_id.into(),
        }
    }
}

fn status_for(error: &McpProxyError) -> StatusCode {
    match error {
        McpProxyError::ServerNotFound(_) => StatusCode::NOT_FOUND,
        McpProxyError::DuplicateName(_) => StatusCode::CONFLICT,
        McpProxyError::ImmutableField { .. } => StatusCode::BAD_REQUEST,
        McpProxyError::ManagementRefused(_) => StatusCode::FORBIDDEN,
        McpProxyError::NotOAuthCapable(_) => StatusCode::BAD_REQUEST,
        McpProxyError::MalformedToolName(_) => StatusCode::BAD_REQUEST,
        McpProxyError::Quarantined(_) => StatusCode::FORBIDDEN,
        McpProxyError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
        McpProxyError::Config(_) => StatusCode::BAD_REQUEST,
        McpProxyError::Protocol(_) | McpProxyError::Storage(_) | McpProxyError::OAuth(_) | McpProxyError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "request_id": self.request_id,
        });
        (self.status, Json(body)).into_response()
    }
}
