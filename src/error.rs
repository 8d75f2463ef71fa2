//! Error types for dlbox
//!
//! This module provides the error handling for the library:
//! - The crate-wide [`Error`] type and [`Result`] alias
//! - [`TaskError`], the classified outcome of a failed download attempt
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for dlbox operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dlbox
///
/// Each variant carries enough context to be logged or turned into an API error
/// without further lookups.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "egress.rotate_among")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No task is registered under the given ID
    #[error("no task with ID {0}")]
    TaskNotFound(String),

    /// The task exists but has produced no output file
    #[error("no download available for task {0}")]
    NoOutput(String),

    /// Proxy management was requested but this deployment has no proxy pool
    #[error("proxy pool is not enabled on this server")]
    NoProxyListener,

    /// The proxy pool actor has stopped
    #[error("proxy pool is no longer running")]
    ProxyPoolClosed,

    /// A download request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// External tool execution failed (download tool, rclone)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// A protocol message could not be encoded, decoded or matched
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Websocket transport error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// No matching response arrived before the caller-side deadline
    #[error("request {nonce} timed out after {after:?}")]
    Timeout {
        /// Nonce of the request that timed out
        nonce: u64,
        /// How long the caller waited
        after: Duration,
    },

    /// The session ended while a request was still pending
    #[error("session closed")]
    SessionClosed,

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),
}

/// Classified failure of a download attempt
///
/// Produced by a [`FailureClassifier`](crate::classify::FailureClassifier) from the
/// attempt's log. Whether an error is worth another attempt is decided by
/// [`IsRetryable`](crate::retry::IsRetryable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskError {
    /// The failure did not match any known signature
    Unknown,
    /// The remote content does not exist or is blocked; retrying will not help
    VideoNotAvailable,
    /// The remote host dropped the connection; usually caused by the egress address
    ConnectionForciblyClosed,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Unknown => write!(f, "unknown error"),
            TaskError::VideoNotAvailable => write!(f, "video not available"),
            TaskError::ConnectionForciblyClosed => {
                write!(f, "connection forcibly closed by the remote host")
            }
        }
    }
}

impl std::error::Error for TaskError {}

/// API error response format
///
/// Returned by API endpoints when an error occurs.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "task_not_found",
///     "message": "no task with ID 3f1c…",
///     "details": {
///       "task_id": "3f1c…"
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "task_not_found")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an "unauthorized" error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::InvalidRequest(_) => 400,
            Error::Protocol(_) => 400,

            Error::TaskNotFound(_) => 404,
            Error::NoOutput(_) => 404,

            Error::Timeout { .. } => 504,

            Error::NoProxyListener => 503,
            Error::ProxyPoolClosed => 503,
            Error::ExternalTool(_) => 503,
            Error::SessionClosed => 503,

            Error::WebSocket(_) => 502,

            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::TaskNotFound(_) => "task_not_found",
            Error::NoOutput(_) => "no_download_available",
            Error::NoProxyListener => "no_proxy_listener",
            Error::ProxyPoolClosed => "proxy_pool_closed",
            Error::InvalidRequest(_) => "validation_error",
            Error::ExternalTool(_) => "external_tool_error",
            Error::Protocol(_) => "protocol_error",
            Error::WebSocket(_) => "websocket_error",
            Error::Timeout { .. } => "timeout",
            Error::SessionClosed => "session_closed",
            Error::ApiServerError(_) => "api_server_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::TaskNotFound(id) | Error::NoOutput(id) => Some(serde_json::json!({
                "task_id": id,
            })),
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({
                "key": key,
            })),
            Error::Timeout { nonce, after } => Some(serde_json::json!({
                "nonce": nonce,
                "after_ms": after.as_millis() as u64,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
