use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use relay_core::RelayErr;
use serde_json::json;

/// Client-facing error: a stable kind tag plus a short reason. Internal
/// detail (stack traces, subprocess paths) stops here.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn missing_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "auth:missing-token",
            "Authorization header required",
        )
    }

    pub fn bad_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth:bad-token", "invalid token")
    }

    pub fn missing_user() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "auth:missing-user",
            "X-User-ID header required",
        )
    }
}

impl From<RelayErr> for ApiError {
    fn from(err: RelayErr) -> Self {
        let kind = err.kind();
        let status = match kind {
            k if k.starts_with("validation:") => StatusCode::BAD_REQUEST,
            "store:unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "mcp:spawn-failed" | "mcp:handshake-timeout" | "mcp:transport" => {
                StatusCode::BAD_GATEWAY
            }
            "model:upstream" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // The display string of validation and lookup errors is already
        // client-safe; everything else gets a terse generic reason.
        let message = match kind {
            k if k.starts_with("validation:") => err.to_string(),
            "store:unavailable" => "configuration store unavailable".to_string(),
            k if k.starts_with("mcp:") => "MCP server failed to start".to_string(),
            "model:upstream" => "upstream model request failed".to_string(),
            _ => "internal error".to_string(),
        };
        Self::new(status, kind, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}
