//! Task manager: deduplicated, retried executions of the download tool
//!
//! The manager owns the task table, indexed both by task ID and by dedup key
//! (see [`DownloadRequest::key`]). A request whose key maps to a live or
//! recently finished task attaches to that task instead of starting a new
//! one. Each new task runs on its own tokio task:
//! - [`execute`] - attempt loop, egress selection, classification, hooks
//! - [`files`] - per-task log and output paths
//! - [`task`] - per-task state, listeners and hooks
//!
//! Finished tasks stay in the table for `completion_grace`, then shut down for
//! `shutdown_grace`, then are removed together with their files.

mod execute;
mod files;
mod task;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use task::{Task, TaskHook, TaskOutcome};

use crate::actions;
use crate::classify::{FailureClassifier, SignatureClassifier};
use crate::config::{ActionsConfig, Config, StorageConfig, TaskConfig, ToolConfig};
use crate::error::{Error, Result};
use crate::proxy::ProxyPool;
use crate::rotator::AddressRotator;
use crate::types::{
    DownloadRequest, FeatureSet, ListenCondition, TaskId, TaskInfo, TaskOutput, TaskStatus,
    TaskSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};

/// Outbound identity sources consulted for every attempt
#[derive(Clone, Default)]
pub struct Egress {
    /// Proxy pool, tried first
    pub proxies: Option<ProxyPool>,
    /// Source-address rotation, used when no proxy was borrowed
    pub rotator: Option<Arc<AddressRotator>>,
}

/// Result of [`TaskManager::request_download`]
#[derive(Debug)]
pub struct Submission {
    /// Task serving the request
    pub task: Arc<Task>,
    /// Whether the task was started by this request
    pub created: bool,
    /// Fires with the outcome, when the caller asked to listen
    pub listener: Option<oneshot::Receiver<TaskOutcome>>,
}

#[derive(Default)]
pub(crate) struct TaskTable {
    by_id: HashMap<TaskId, Arc<Task>>,
    by_key: HashMap<String, TaskId>,
}

impl TaskTable {
    fn find_by_key(&self, key: &str) -> Option<Arc<Task>> {
        self.by_key
            .get(key)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    fn insert(&mut self, task: Arc<Task>) {
        self.by_key.insert(task.key().to_string(), task.id().clone());
        self.by_id.insert(task.id().clone(), task);
    }

    /// Drop `task` from both indexes; the key index is only touched while it
    /// still points at this task
    fn remove(&mut self, task: &Task) {
        self.by_id.remove(task.id());
        if self.by_key.get(task.key()) == Some(task.id()) {
            self.by_key.remove(task.key());
        }
    }
}

/// Everything a running task needs, shared by all tasks of one manager
pub(crate) struct TaskEnv {
    pub(crate) tool: ToolConfig,
    pub(crate) storage: StorageConfig,
    pub(crate) tasks: TaskConfig,
    pub(crate) actions: ActionsConfig,
    pub(crate) egress: Egress,
    pub(crate) classifier: Arc<dyn FailureClassifier>,
    pub(crate) table: RwLock<TaskTable>,
}

/// Task manager (cloneable - all state is behind an `Arc`)
#[derive(Clone)]
pub struct TaskManager {
    env: Arc<TaskEnv>,
}

impl TaskManager {
    /// Create a manager using the default log-signature classifier
    pub fn new(config: &Config, egress: Egress) -> Self {
        Self::with_classifier(config, egress, Arc::new(SignatureClassifier::default()))
    }

    /// Create a manager with a custom failure classifier
    pub fn with_classifier(
        config: &Config,
        egress: Egress,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Self {
        Self {
            env: Arc::new(TaskEnv {
                tool: config.tool.clone(),
                storage: config.storage.clone(),
                tasks: config.tasks.clone(),
                actions: config.actions.clone(),
                egress,
                classifier,
                table: RwLock::new(TaskTable::default()),
            }),
        }
    }

    /// Proxy pool, if this manager has one
    pub fn proxies(&self) -> Option<&ProxyPool> {
        self.env.egress.proxies.as_ref()
    }

    /// Start a download or attach to an identical one
    ///
    /// If a live or cached task exists for the request's key it is returned
    /// with `created == false`; otherwise a new task is registered and started.
    /// When `listen` asks for it, the submission carries a receiver that fires
    /// with the task's outcome (immediately if the outcome is already known).
    pub async fn request_download(
        &self,
        request: DownloadRequest,
        listen: ListenCondition,
    ) -> Result<Submission> {
        request.validate()?;
        let key = request.key();

        let mut table = self.env.table.write().await;

        if let Some(task) = table.find_by_key(&key) {
            debug!(task_id = %task.id(), key = %key, "Attaching to existing task");
            let listener = listen.is_listening().then(|| task.listen());
            return Ok(Submission {
                task,
                created: false,
                listener,
            });
        }

        let actions = actions::resolve(&request.completion_actions, &self.env.actions);
        let task = Arc::new(Task::new(request, actions));
        let listener = listen.is_listening().then(|| task.listen());
        table.insert(task.clone());
        drop(table);

        info!(task_id = %task.id(), url = %task.url(), args = ?task.args(), "Download requested");
        execute::spawn(self.env.clone(), task.clone());

        Ok(Submission {
            task,
            created: true,
            listener,
        })
    }

    /// Look up a task by ID
    pub async fn get(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.env.table.read().await.by_id.get(id).cloned()
    }

    /// Look up a task by dedup key
    pub async fn find_by_key(&self, key: &str) -> Option<Arc<Task>> {
        self.env.table.read().await.find_by_key(key)
    }

    /// Number of tasks in the table (running and cached)
    pub async fn len(&self) -> usize {
        self.env.table.read().await.by_id.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn require(&self, id: &TaskId) -> Result<Arc<Task>> {
        self.get(id)
            .await
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Snapshot of a task
    pub async fn task_info(&self, id: &TaskId) -> Result<TaskInfo> {
        let task = self.require(id).await?;
        let log_tail = files::log_tail(&files::log_path(&self.env.storage, id)).await;

        let status = task.status();
        let summary = TaskSummary {
            task_id: task.id().clone(),
            url: task.url().to_string(),
            args: task.args().to_vec(),
            command_line: task.command_line(),
            logs_location: format!("/{id}/logs"),
            status,
            log_tail,
            error: task.error(),
        };

        Ok(match status {
            TaskStatus::Running => {
                let process_info = task.process();
                let process_error = process_info
                    .is_none()
                    .then(|| "no attempt process is alive".to_string());
                TaskInfo::Running {
                    summary,
                    process_info,
                    process_error,
                }
            }
            TaskStatus::CompleteSuccess => TaskInfo::Successful {
                summary,
                data_location: format!("/{id}/download"),
            },
            _ => TaskInfo::Generic { summary },
        })
    }

    /// All log lines of a task; empty before the first attempt writes any
    pub async fn task_logs(&self, id: &TaskId) -> Result<Vec<String>> {
        self.require(id).await?;
        Ok(files::read_lines(&files::log_path(&self.env.storage, id)).await)
    }

    /// The task's output file, read into memory
    pub async fn task_output(&self, id: &TaskId) -> Result<TaskOutput> {
        self.require(id).await?;
        let path = self
            .output_path(id)
            .await
            .ok_or_else(|| Error::NoOutput(id.to_string()))?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoOutput(id.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(TaskOutput {
            bytes,
            mime_type: files::mime_type(&path),
        })
    }

    /// Path of the task's output file, if the tool has produced one
    pub async fn output_path(&self, id: &TaskId) -> Option<std::path::PathBuf> {
        files::find_output(&self.env.storage.holding_dir, id).await
    }

    /// Capabilities advertised to clients
    pub fn features(&self) -> FeatureSet {
        FeatureSet {
            tool_program: self.env.tool.program.display().to_string(),
            default_args: self.env.tool.default_args.clone(),
            rotating_addresses: self.env.egress.rotator.is_some(),
            listening_for_proxy: self.env.egress.proxies.is_some(),
            completion_actions: actions::features(&self.env.actions),
        }
    }
}
