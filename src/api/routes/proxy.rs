//! Proxy pool handlers.

use crate::api::AppState;
use crate::error::Error;
use crate::proxy::ProxyPool;
use crate::types::ProxyConfig;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

fn pool(state: &AppState) -> Result<&ProxyPool, Error> {
    state.tasks().proxies().ok_or(Error::NoProxyListener)
}

/// GET /proxy - Proxies with their current load and error counts
#[utoipa::path(
    get,
    path = "/proxy",
    tag = "proxy",
    responses(
        (status = 200, description = "Pool snapshot", body = Vec<crate::proxy::ProxyEntry>),
        (status = 503, description = "No proxy pool configured", body = crate::error::ApiError)
    )
)]
pub async fn list_proxies(State(state): State<AppState>) -> Result<Response, Error> {
    let entries = pool(&state)?.snapshot().await?;
    Ok((StatusCode::OK, Json(entries)).into_response())
}

/// POST /proxy/add - Add a proxy to the pool
#[utoipa::path(
    post,
    path = "/proxy/add",
    tag = "proxy",
    request_body = ProxyConfig,
    responses(
        (status = 201, description = "Proxy added", body = ProxyConfig),
        (status = 200, description = "A proxy with this address already exists", body = ProxyConfig),
        (status = 503, description = "No proxy pool configured", body = crate::error::ApiError)
    )
)]
pub async fn add_proxy(
    State(state): State<AppState>,
    Json(proxy): Json<ProxyConfig>,
) -> Result<Response, Error> {
    let added = pool(&state)?.add(proxy.clone()).await?;
    let status = if added {
        tracing::info!(proxy = %proxy.address, limit = proxy.limit, "Proxy added");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(proxy)).into_response())
}

/// POST /proxy/delete - Remove a proxy by address
#[utoipa::path(
    post,
    path = "/proxy/delete",
    tag = "proxy",
    request_body(content = String, description = "Proxy address"),
    responses(
        (status = 200, description = "The removed proxy, or null when none matched", body = ProxyConfig),
        (status = 503, description = "No proxy pool configured", body = crate::error::ApiError)
    )
)]
pub async fn remove_proxy(
    State(state): State<AppState>,
    Json(address): Json<String>,
) -> Result<Response, Error> {
    let removed = pool(&state)?.remove(address).await?;
    if let Some(proxy) = &removed {
        tracing::info!(proxy = %proxy.address, "Proxy removed");
    }
    Ok((StatusCode::OK, Json(removed)).into_response())
}
