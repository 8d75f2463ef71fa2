//! Authentication middleware for the REST API
//!
//! Provides optional API key authentication. When `ApiConfig::api_key` is set,
//! every request must carry the key either in `X-Api-Key` or in
//! `Authorization` (bare or as a `Bearer` token), or it receives a 401.

use crate::error::ApiError;
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Authentication middleware checking the API key headers
///
/// # Examples
///
/// ```no_run
/// use axum::{Router, middleware};
/// use dlbox::api::auth::require_api_key;
///
/// let api_key = Some("secret-key-123".to_string());
/// let router: Router = Router::new()
///     .layer(middleware::from_fn_with_state(
///         api_key,
///         require_api_key
///     ));
/// ```
pub async fn require_api_key(
    State(expected_api_key): State<Option<String>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected_key) = expected_api_key else {
        return next.run(request).await;
    };

    match provided_key(request.headers()) {
        Some(provided) if constant_time_eq(provided.as_bytes(), expected_key.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => unauthorized_response("Invalid API key"),
        None => unauthorized_response("Missing X-Api-Key or Authorization header"),
    }
}

/// Key from `X-Api-Key`, else from `Authorization` with any `Bearer ` prefix removed
fn provided_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Always compares all bytes regardless of where the first mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn unauthorized_response(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ApiError::unauthorized(message))).into_response()
}
