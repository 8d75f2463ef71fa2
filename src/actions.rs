//! Completion actions
//!
//! A download request may ask for post-completion steps
//! ([`CompletionRequest`]). When the task is created, each request is resolved
//! against the server's [`ActionsConfig`]; requests for actions the server
//! does not offer are dropped with a warning. Resolved actions run after the
//! task finishes, each on its own tokio task so one failing upload never
//! affects another.

use crate::config::{ActionsConfig, RcloneConfig};
use crate::error::{Error, Result, TaskError};
use crate::types::{CompletionActionFeature, CompletionRequest, TaskId};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything an action may look at once a task has finished
#[derive(Clone, Debug)]
pub struct CompletionContext {
    /// Finished task
    pub task_id: TaskId,
    /// Task URL
    pub url: String,
    /// Log file of the last attempt
    pub log_file: PathBuf,
    /// Output file, when the tool produced one
    pub output_file: Option<PathBuf>,
    /// Classified error of the last attempt, if it failed
    pub error: Option<TaskError>,
}

/// A completion step bound to one task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionAction {
    /// Copy the output to an rclone remote
    Rclone(RcloneUpload),
}

impl CompletionAction {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CompletionAction::Rclone(_) => "rclone",
        }
    }

    /// Run the action for a finished task
    pub async fn on_completion(&self, ctx: &CompletionContext) -> Result<()> {
        match self {
            CompletionAction::Rclone(upload) => match &ctx.output_file {
                Some(output) => upload.run(output).await,
                None => {
                    debug!(task_id = %ctx.task_id, "No output to upload, skipping rclone");
                    Ok(())
                }
            },
        }
    }
}

/// Upload of a task output with `rclone copyto`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RcloneUpload {
    config: RcloneConfig,
    path: String,
}

impl RcloneUpload {
    /// Bind a requested destination path to the server's rclone settings
    pub fn new(config: RcloneConfig, path: impl Into<String>) -> Self {
        Self {
            config,
            path: path.into(),
        }
    }

    /// Remote destination: `{endpoint}:{base_path}/{path}`, or `{endpoint}:{path}`
    /// without a base path
    pub fn destination(&self) -> String {
        match &self.config.base_path {
            Some(base) => format!("{}:{}/{}", self.config.endpoint, base, self.path),
            None => format!("{}:{}", self.config.endpoint, self.path),
        }
    }

    /// Arguments passed to the rclone program
    pub fn args(&self, output: &Path) -> Vec<String> {
        vec![
            "copyto".to_string(),
            output.display().to_string(),
            self.destination(),
        ]
    }

    async fn run(&self, output: &Path) -> Result<()> {
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            debug!(output = %output.display(), "Output vanished before upload");
            return Ok(());
        }

        let destination = self.destination();
        info!(output = %output.display(), destination = %destination, "Uploading with rclone");

        let result = tokio::process::Command::new(&self.config.program)
            .args(self.args(output))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to run {}: {e}", self.config.program)))?;

        if result.status.success() {
            info!(destination = %destination, "rclone upload finished");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr);
            Err(Error::ExternalTool(format!(
                "rclone exited with {:?}: {}",
                result.status.code(),
                stderr.trim()
            )))
        }
    }
}

/// Resolve requested actions against what this server offers
pub fn resolve(requests: &[CompletionRequest], config: &ActionsConfig) -> Vec<CompletionAction> {
    requests
        .iter()
        .filter_map(|request| match request {
            CompletionRequest::Rclone { path } => match &config.rclone {
                Some(rclone) => Some(CompletionAction::Rclone(RcloneUpload::new(
                    rclone.clone(),
                    path.clone(),
                ))),
                None => {
                    warn!(path = %path, "rclone completion requested but not configured, dropping");
                    None
                }
            },
        })
        .collect()
}

/// Actions advertised in the server's feature set
pub fn features(config: &ActionsConfig) -> Vec<CompletionActionFeature> {
    config
        .rclone
        .iter()
        .cloned()
        .map(CompletionActionFeature::Rclone)
        .collect()
}

/// Run every action on its own task; failures are logged per action
pub(crate) fn spawn_all(actions: Vec<CompletionAction>, ctx: CompletionContext) -> Vec<JoinHandle<()>> {
    actions
        .into_iter()
        .map(|action| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = action.on_completion(&ctx).await {
                    warn!(
                        task_id = %ctx.task_id,
                        action = action.name(),
                        error = %e,
                        "Completion action failed"
                    );
                }
            })
        })
        .collect()
}
