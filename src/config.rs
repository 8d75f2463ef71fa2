//! Configuration types for dlbox

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use utoipa::ToSchema;

/// Main configuration for a [`DownloadBox`](crate::DownloadBox)
///
/// Every section has sensible defaults, so `Config::default()` runs a box that
/// invokes `yt-dlp` from `PATH` without proxies or address rotation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// External download tool
    #[serde(default)]
    pub tool: ToolConfig,

    /// Log and output directories
    #[serde(default)]
    pub storage: StorageConfig,

    /// Task lifecycle (attempts, grace periods)
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Outbound network identity (proxy pool, address rotation)
    #[serde(default)]
    pub egress: EgressConfig,

    /// Completion actions available to requests
    #[serde(default)]
    pub actions: ActionsConfig,

    /// REST API and websocket endpoint
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Read a configuration from a JSON file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| crate::Error::Config {
            message: format!("failed to parse {}: {e}", path.display()),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.tasks.retry.max_attempts == 0 {
            return Err(crate::Error::Config {
                message: "max_attempts must be at least 1".into(),
                key: Some("tasks.max_attempts".into()),
            });
        }
        if let Some(rclone) = &self.actions.rclone {
            if rclone.endpoint.trim().is_empty() {
                return Err(crate::Error::Config {
                    message: "rclone endpoint must not be empty".into(),
                    key: Some("actions.rclone.endpoint".into()),
                });
            }
        }
        Ok(())
    }
}

/// External download tool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Program to execute (default: `yt-dlp`, resolved through `PATH`)
    #[serde(default = "default_tool_program")]
    pub program: PathBuf,

    /// Arguments placed before every caller's own arguments
    #[serde(default)]
    pub default_args: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_tool_program(),
            default_args: Vec::new(),
        }
    }
}

/// Where per-task logs and outputs are kept
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for `{id}.log` files (default: "logs")
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Directory the tool writes `{id}.{ext}` outputs into (default: "holding")
    #[serde(default = "default_holding_dir")]
    pub holding_dir: PathBuf,

    /// Remove both directories when the box shuts down (default: true)
    #[serde(default = "default_true")]
    pub clean_on_shutdown: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            holding_dir: default_holding_dir(),
            clean_on_shutdown: true,
        }
    }
}

/// Task lifecycle settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Attempt budget and pacing
    #[serde(flatten)]
    pub retry: RetryConfig,

    /// How long a finished task stays complete before shutting down (default: 120 seconds)
    #[serde(default = "default_completion_grace", with = "duration_serde")]
    pub completion_grace: Duration,

    /// How long a shutting-down task lingers before removal (default: 60 seconds)
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            completion_grace: default_completion_grace(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Attempt loop configuration
///
/// `max_attempts` counts every execution, including the first one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: 0 seconds)
    #[serde(default, with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: Duration::ZERO,
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Outbound identity configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Enable the proxy pool, persisting its list to this file
    #[serde(default)]
    pub proxy_file: Option<PathBuf>,

    /// Address blocks to draw `--source-address` values from (empty = disabled)
    #[serde(default)]
    pub rotate_among: Vec<IpNet>,
}

/// Completion actions offered by this server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Upload outputs with rclone (None = not offered)
    #[serde(default)]
    pub rclone: Option<RcloneConfig>,
}

/// rclone upload settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RcloneConfig {
    /// rclone program (default: `rclone`)
    #[serde(default = "default_rclone_program")]
    pub program: String,

    /// Remote name as configured in rclone
    pub endpoint: String,

    /// Remote backend type, informational (e.g. "s3")
    #[serde(default)]
    pub endpoint_type: Option<String>,

    /// Prefix for every uploaded path
    #[serde(default)]
    pub base_path: Option<String>,

    /// Public URL under which uploaded paths become reachable, informational
    #[serde(default)]
    pub resulting_base_url: Option<String>,
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:6789)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Optional API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: true)
    #[serde(default = "default_true")]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_key: None,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: true,
        }
    }
}

/// Settings for a [`RemoteBox`](crate::protocol::RemoteBox) client session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key sent as a bearer token in the `Authorization` header
    #[serde(default)]
    pub api_key: Option<String>,

    /// Wire format requested through the `Accept` header (default: JSON)
    #[serde(default)]
    pub format: crate::protocol::WireFormat,

    /// Deadline for ordinary requests (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Deadline for downloads that wait for completion (default: 1 hour)
    #[serde(default = "default_download_timeout", with = "duration_serde")]
    pub download_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            format: crate::protocol::WireFormat::default(),
            request_timeout: default_request_timeout(),
            download_timeout: default_download_timeout(),
        }
    }
}

fn default_tool_program() -> PathBuf {
    which::which("yt-dlp")
        .or_else(|_| which::which("youtube-dl"))
        .unwrap_or_else(|_| PathBuf::from("yt-dlp"))
}

fn default_rclone_program() -> String {
    "rclone".to_string()
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_holding_dir() -> PathBuf {
    PathBuf::from("holding")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_completion_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6789))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

// Durations are written as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
