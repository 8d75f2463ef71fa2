//! Per-task files: `logs_dir/{id}.log` and `holding_dir/{id}.{ext}`

use crate::config::StorageConfig;
use crate::types::TaskId;
use std::path::{Path, PathBuf};
use tracing::warn;

pub(crate) fn log_path(storage: &StorageConfig, id: &TaskId) -> PathBuf {
    storage.logs_dir.join(format!("{id}.log"))
}

/// Output template handed to the tool's `-o`
pub(crate) fn output_template(storage: &StorageConfig, id: &TaskId) -> String {
    storage
        .holding_dir
        .join(format!("{id}.%(ext)s"))
        .display()
        .to_string()
}

/// The holding-directory file whose stem is the task ID
pub(crate) async fn find_output(holding_dir: &Path, id: &TaskId) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(holding_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && path.file_stem().and_then(|s| s.to_str()) == Some(id.as_str()) {
            return Some(path);
        }
    }
    None
}

/// All lines of a log; a missing log has no lines
pub(crate) async fn read_lines(path: &Path) -> Vec<String> {
    crate::classify::read_log(path)
        .await
        .lines()
        .map(str::to_string)
        .collect()
}

pub(crate) async fn log_tail(path: &Path) -> Option<String> {
    read_lines(path).await.pop()
}

pub(crate) fn mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}

/// Remove a file, ignoring files that are already gone
pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete task file");
        }
    }
}
