//! Application state for the API server

use crate::{Config, DownloadBox};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (cheap Arc clone).
#[derive(Clone)]
pub struct AppState {
    /// The box serving requests
    pub download_box: Arc<DownloadBox>,

    /// Configuration (read-only)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(download_box: Arc<DownloadBox>, config: Arc<Config>) -> Self {
        Self {
            download_box,
            config,
        }
    }

    /// Task manager of the box
    pub fn tasks(&self) -> &crate::tasks::TaskManager {
        self.download_box.tasks()
    }
}
