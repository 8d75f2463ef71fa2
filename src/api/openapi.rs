//! OpenAPI documentation and schema generation
//!
//! Defines the OpenAPI specification for the dlbox REST API using utoipa for
//! compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the dlbox REST API
///
/// The document is served at:
/// - `/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation (if enabled)
#[derive(OpenApi)]
#[openapi(
    info(
        title = "dlbox REST API",
        version = "0.1.0",
        description = "Deduplicated downloads through an external tool, with proxy and source-address management"
    ),
    servers(
        (url = "http://localhost:6789", description = "Local development server")
    ),
    paths(
        // Tasks
        crate::api::routes::request_download,
        crate::api::routes::get_task_info,
        crate::api::routes::get_task_logs,
        crate::api::routes::get_task_download,

        // Proxy pool
        crate::api::routes::list_proxies,
        crate::api::routes::add_proxy,
        crate::api::routes::remove_proxy,

        // System
        crate::api::routes::health_check,
        crate::api::routes::server_info,
        crate::api::routes::openapi_spec,

        // Protocol
        crate::api::routes::connect,
    ),
    components(schemas(
        crate::types::TaskId,
        crate::types::TaskStatus,
        crate::types::DownloadRequest,
        crate::types::DownloadResponse,
        crate::types::CompletionRequest,
        crate::types::ListenCondition,
        crate::types::ProxyConfig,
        crate::types::ProcessInfo,
        crate::types::TaskSummary,
        crate::types::TaskInfo,
        crate::types::FeatureSet,
        crate::types::CompletionActionFeature,
        crate::config::RcloneConfig,
        crate::proxy::ProxyEntry,
        crate::error::TaskError,
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "tasks", description = "Download submission and task reads"),
        (name = "proxy", description = "Proxy pool management"),
        (name = "system", description = "Health checks, server info, OpenAPI spec"),
        (name = "protocol", description = "Websocket endpoint for the multiplexed protocol"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Security addon to add API key authentication scheme to OpenAPI spec
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = &mut openapi.components {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-Api-Key"),
                    ),
                ),
            );
        }
    }
}
