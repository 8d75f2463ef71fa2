//! System handlers: health, server info, OpenAPI.

use crate::api::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// GET /health - Health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is healthy")
    )
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tasks": state.tasks().len().await,
    }))
}

/// GET /info - Feature set of this box
#[utoipa::path(
    get,
    path = "/info",
    tag = "system",
    responses(
        (status = 200, description = "Advertised capabilities", body = crate::types::FeatureSet)
    )
)]
pub async fn server_info(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.tasks().features()))
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}
