use axum::extract::FromRequestParts;
use axum::extract::Request;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::SharedState;
use crate::error::ApiError;

/// Opaque tenant identifier from `X-User-ID`. Non-empty, printable, bounded.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

const USER_ID_HEADER: &str = "x-user-id";
const MAX_USER_ID_LEN: usize = 256;

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        if raw.is_empty()
            || raw.len() > MAX_USER_ID_LEN
            || raw.chars().any(|c| c.is_control())
        {
            return Err(ApiError::missing_user());
        }
        Ok(UserId(raw.to_string()))
    }
}

/// Bearer-token gate for everything under `/v1` except the health probe.
/// Timing-safe comparison; an attacker learns nothing from response times.
pub async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::missing_token)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::missing_token)?;

    let expected = expected_token(&state).await?;
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return Err(ApiError::bad_token());
    }

    Ok(next.run(request).await)
}

async fn expected_token(state: &AppState) -> Result<String, ApiError> {
    state.resolver.get().await.map_err(|e| {
        tracing::error!("API key resolution failed: {e}");
        ApiError::new(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "store:unavailable",
            "credential resolution failed",
        )
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
