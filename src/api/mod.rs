//! REST API server module
//!
//! Exposes task reads, download submission, proxy pool management and the
//! websocket endpoint hosting protocol sessions.

use crate::{Config, DownloadBox, Result};
use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Tasks
/// - `POST /download` - Start a download or attach to an identical one
/// - `GET /:task_id`, `GET /:task_id/info` - Task snapshot
/// - `GET /:task_id/log`, `GET /:task_id/logs` - Task log lines
/// - `GET /:task_id/download` - Output file of a successful task
///
/// ## Proxy Pool
/// - `GET /proxy` - Pool snapshot
/// - `POST /proxy/add` - Add a proxy
/// - `POST /proxy/delete` - Remove a proxy by address
///
/// ## System
/// - `GET /info` - Feature set
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive Swagger UI documentation (if enabled)
///
/// ## Protocol
/// - `GET /connect` - Websocket upgrade hosting a protocol session
pub fn create_router(download_box: Arc<DownloadBox>, config: Arc<Config>) -> Router {
    let state = AppState::new(download_box, config.clone());

    let router = Router::new()
        // Tasks
        .route("/download", post(routes::request_download))
        .route("/:task_id", get(routes::get_task_info))
        .route("/:task_id/info", get(routes::get_task_info))
        .route("/:task_id/log", get(routes::get_task_logs))
        .route("/:task_id/logs", get(routes::get_task_logs))
        .route("/:task_id/download", get(routes::get_task_download))
        // Proxy pool
        .route("/proxy", get(routes::list_proxies))
        .route("/proxy/add", post(routes::add_proxy))
        .route("/proxy/delete", post(routes::remove_proxy))
        // System
        .route("/info", get(routes::server_info))
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        // Protocol
        .route("/connect", get(routes::connect));

    // The UI serves its own copy of the document so it does not shadow /openapi.json
    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let router = router.with_state(state);

    let router = if config.api.api_key.is_some() {
        router.layer(middleware::from_fn_with_state(
            config.api.api_key.clone(),
            auth::require_api_key,
        ))
    } else {
        router
    };

    if config.api.cors_enabled {
        router.layer(build_cors_layer(&config.api.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// `"*"` or an empty list allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Runs until the server stops.
///
/// # Example
///
/// ```no_run
/// use dlbox::{Config, DownloadBox};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let download_box = DownloadBox::new(config).await?;
/// let config = download_box.config.clone();
///
/// dlbox::api::start_api_server(Arc::new(download_box), config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(download_box: Arc<DownloadBox>, config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(config.api.bind_address)
        .await
        .map_err(crate::error::Error::Io)?;
    serve_on(listener, download_box, config).await
}

/// Serve the API on an already bound listener
pub async fn serve_on(
    listener: TcpListener,
    download_box: Arc<DownloadBox>,
    config: Arc<Config>,
) -> Result<()> {
    let address = listener.local_addr().map_err(crate::error::Error::Io)?;
    let app = create_router(download_box, config);

    tracing::info!(address = %address, "API server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
