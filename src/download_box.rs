//! Top-level service wiring
//!
//! [`DownloadBox`] builds the proxy pool, the address rotator and the task
//! manager from a [`Config`], serves the HTTP API, and cleans up its working
//! directories on shutdown.

use crate::config::Config;
use crate::error::Result;
use crate::proxy::ProxyPool;
use crate::rotator::AddressRotator;
use crate::tasks::{Egress, TaskManager};
use std::path::Path;
use std::sync::Arc;

/// A download box (cloneable - all state is behind `Arc`s)
#[derive(Clone)]
pub struct DownloadBox {
    /// Configuration the box was built from
    pub config: Arc<Config>,
    tasks: TaskManager,
}

impl DownloadBox {
    /// Build a box from its configuration
    ///
    /// Creates the log and holding directories, opens the proxy pool when a
    /// proxy file is configured and starts address rotation when address
    /// blocks are configured.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.logs_dir).await?;
        tokio::fs::create_dir_all(&config.storage.holding_dir).await?;

        let proxies = match &config.egress.proxy_file {
            Some(path) => Some(ProxyPool::open(path.clone()).await),
            None => None,
        };
        let rotator = (!config.egress.rotate_among.is_empty())
            .then(|| Arc::new(AddressRotator::spawn(config.egress.rotate_among.clone())));

        tracing::info!(
            tool = %config.tool.program.display(),
            proxy_pool = proxies.is_some(),
            rotating_addresses = rotator.is_some(),
            rclone = config.actions.rclone.is_some(),
            "Download box ready"
        );

        let tasks = TaskManager::new(&config, Egress { proxies, rotator });
        Ok(Self {
            config: Arc::new(config),
            tasks,
        })
    }

    /// Task manager of this box
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Serve the HTTP API until the server stops
    pub async fn serve(&self) -> Result<()> {
        crate::api::start_api_server(Arc::new(self.clone()), self.config.clone()).await
    }

    /// Release on-disk state
    ///
    /// With `storage.clean_on_shutdown` the log and holding directories are
    /// deleted.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down download box");
        if self.config.storage.clean_on_shutdown {
            remove_dir(&self.config.storage.logs_dir).await;
            remove_dir(&self.config.storage.holding_dir).await;
        }
        Ok(())
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove directory"),
    }
}
