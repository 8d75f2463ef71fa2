//! Core types for dlbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::RcloneConfig;
use crate::error::TaskError;

/// Unique identifier for a task (a UUID v4 string)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh random task ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle status
///
/// Transitions only move forward:
/// `Initialising -> Running -> CompleteSuccess | CompleteFailure -> ShuttingDown`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no process spawned yet
    #[default]
    Initialising,
    /// An attempt is executing (or between attempts)
    Running,
    /// Finished with an output file
    CompleteSuccess,
    /// Finished without a usable output
    CompleteFailure,
    /// Outcome recorded, awaiting removal
    ShuttingDown,
}

impl TaskStatus {
    /// Whether the task sits in one of the two complete states
    ///
    /// `ShuttingDown` is deliberately not complete.
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::CompleteSuccess | TaskStatus::CompleteFailure)
    }

    /// Whether the task's outcome has been recorded
    pub fn has_outcome(&self) -> bool {
        self.is_complete() || matches!(self, TaskStatus::ShuttingDown)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Initialising => 0,
            TaskStatus::Running => 1,
            TaskStatus::CompleteSuccess | TaskStatus::CompleteFailure => 2,
            TaskStatus::ShuttingDown => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only order
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        next.rank() >= self.rank() && !(self.is_complete() && next.is_complete() && *self != next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Initialising => "initialising",
            TaskStatus::Running => "running",
            TaskStatus::CompleteSuccess => "complete_success",
            TaskStatus::CompleteFailure => "complete_failure",
            TaskStatus::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// A request to download one URL with the external tool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DownloadRequest {
    /// Source URL handed to the tool as its last argument
    pub url: String,

    /// Extra tool arguments (part of the dedup key)
    #[serde(default)]
    pub args: Vec<String>,

    /// Post-completion steps for this request
    #[serde(default)]
    pub completion_actions: Vec<CompletionRequest>,
}

impl DownloadRequest {
    /// Create a request without arguments or completion actions
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            args: Vec::new(),
            completion_actions: Vec::new(),
        }
    }

    /// Replace the argument list
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Identity used to coalesce identical requests: the JSON array `[url, [args...]]`
    ///
    /// Every distinct argument vector yields a distinct key. Completion
    /// actions are not part of the key.
    pub fn key(&self) -> String {
        serde_json::json!([self.url, self.args]).to_string()
    }

    /// Reject requests the tool could never act on
    pub fn validate(&self) -> crate::Result<()> {
        if self.url.trim().is_empty() {
            return Err(crate::Error::InvalidRequest("url must not be empty".into()));
        }
        url::Url::parse(&self.url)
            .map_err(|e| crate::Error::InvalidRequest(format!("invalid url {}: {e}", self.url)))?;
        Ok(())
    }
}

/// Acknowledgement of a download request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DownloadResponse {
    /// Task handling the request
    pub id: TaskId,
    /// Whether a new task was started (false when deduplicated)
    pub created: bool,
    /// Task URL
    pub url: String,
    /// Task arguments
    pub args: Vec<String>,
}

/// Request-scoped completion step, resolved against server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRequest {
    /// Upload the output with rclone to `{endpoint}:{base_path}/{path}`
    Rclone {
        /// Destination path below the configured base path
        path: String,
    },
}

/// What a download caller wants to hear once the task finishes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ListenCondition {
    /// Acknowledge only
    #[default]
    DoNotListen,
    /// Send a completion response carrying the output bytes
    ListenWithData,
    /// Send a completion response without output bytes
    ListenNoData,
}

impl ListenCondition {
    /// Whether a completion response is wanted at all
    pub fn is_listening(&self) -> bool {
        !matches!(self, ListenCondition::DoNotListen)
    }
}

/// A proxy address with its capacity and error budget
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProxyConfig {
    /// Proxy URL handed to the tool's `--proxy`
    pub address: String,
    /// Maximum concurrent borrows
    pub limit: u32,
    /// Errors tolerated before eviction (default: 3)
    #[serde(default = "default_error_limit")]
    pub error_limit: u32,
}

impl ProxyConfig {
    /// Create a proxy with the default error limit
    pub fn new(address: impl Into<String>, limit: u32) -> Self {
        Self {
            address: address.into(),
            limit,
            error_limit: default_error_limit(),
        }
    }
}

fn default_error_limit() -> u32 {
    3
}

/// Process metadata of a running attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProcessInfo {
    /// OS process ID
    pub pid: u32,
    /// Program executed
    pub command: String,
    /// Arguments passed to the program
    pub arguments: Vec<String>,
    /// Program and arguments joined by spaces
    pub command_line: String,
    /// When the attempt was spawned
    pub start_time: DateTime<Utc>,
}

/// Fields common to every [`TaskInfo`] variant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskSummary {
    /// Task ID
    pub task_id: TaskId,
    /// Source URL
    pub url: String,
    /// Caller arguments
    pub args: Vec<String>,
    /// Full command line of the latest attempt (empty before the first spawn)
    pub command_line: Vec<String>,
    /// Where the log lines can be fetched: `/{id}/logs`
    pub logs_location: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Last line of the log, if any
    pub log_tail: Option<String>,
    /// Classified error of the final attempt, if it failed
    pub error: Option<TaskError>,
}

/// Snapshot of a task as exposed to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskInfo {
    /// Initialising, failed or shutting down
    Generic {
        /// Common fields
        summary: TaskSummary,
    },
    /// An attempt is running
    Running {
        /// Common fields
        summary: TaskSummary,
        /// Process metadata, when a process is alive
        process_info: Option<ProcessInfo>,
        /// Why process metadata is unavailable
        process_error: Option<String>,
    },
    /// Completed with an output
    Successful {
        /// Common fields
        summary: TaskSummary,
        /// Where the output can be fetched: `/{id}/download`
        data_location: String,
    },
}

impl TaskInfo {
    /// Common fields of any variant
    pub fn summary(&self) -> &TaskSummary {
        match self {
            TaskInfo::Generic { summary }
            | TaskInfo::Running { summary, .. }
            | TaskInfo::Successful { summary, .. } => summary,
        }
    }
}

/// Capabilities advertised by a server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FeatureSet {
    /// Download tool program
    pub tool_program: String,
    /// Arguments added to every invocation
    pub default_args: Vec<String>,
    /// Whether `--source-address` rotation is active
    pub rotating_addresses: bool,
    /// Whether the proxy pool is active
    pub listening_for_proxy: bool,
    /// Completion actions requests may use
    pub completion_actions: Vec<CompletionActionFeature>,
}

/// A completion action offered by the server, with its resolved configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompletionActionFeature {
    /// rclone uploads
    Rclone(RcloneConfig),
}

/// Output file of a task, read into memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutput {
    /// File contents
    pub bytes: Vec<u8>,
    /// MIME type guessed from the file extension
    pub mime_type: Option<String>,
}
