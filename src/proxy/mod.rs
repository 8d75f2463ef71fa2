//! Proxy pool
//!
//! All pool operations go through a single worker task, so adds, removals,
//! borrows and returns are totally ordered. Callers talk to the worker through
//! a cloneable [`ProxyPool`] handle; each request carries a oneshot reply
//! channel.
//!
//! The proxy list (addresses, limits and error limits) is written to a JSON
//! file whenever its membership changes and reloaded with zeroed counters at
//! startup. Persistence failures are logged and otherwise ignored.

mod command;
mod state;
mod store;

pub use state::ProxyEntry;

use crate::error::{Error, Result};
use crate::types::ProxyConfig;
use command::PoolCommand;
use state::{PoolState, Returned};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

/// Handle to the proxy pool worker
#[derive(Clone)]
pub struct ProxyPool {
    commands: mpsc::Sender<PoolCommand>,
}

impl ProxyPool {
    /// Open a pool persisted at `path`
    ///
    /// A missing file starts an empty pool. An unreadable file is logged and
    /// also starts an empty pool; the next membership change overwrites it.
    pub async fn open(path: PathBuf) -> Self {
        let proxies = match store::load(&path).await {
            Ok(proxies) => proxies,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load proxy list, starting empty");
                Vec::new()
            }
        };
        info!(path = %path.display(), count = proxies.len(), "Proxy pool loaded");
        Self::spawn(PoolState::from_list(proxies), Some(path))
    }

    /// A pool that is never persisted
    pub fn in_memory(proxies: Vec<ProxyConfig>) -> Self {
        Self::spawn(PoolState::from_list(proxies), None)
    }

    fn spawn(state: PoolState, path: Option<PathBuf>) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_worker(state, path, rx));
        Self { commands }
    }

    /// Add a proxy; false if its address is already pooled
    pub async fn add(&self, proxy: ProxyConfig) -> Result<bool> {
        self.request(|respond_to| PoolCommand::Add { proxy, respond_to })
            .await
    }

    /// Remove the proxy with `address`, returning it if it was pooled
    pub async fn remove(&self, address: impl Into<String>) -> Result<Option<ProxyConfig>> {
        let address = address.into();
        self.request(|respond_to| PoolCommand::Remove {
            address,
            respond_to,
        })
        .await
    }

    /// Borrow the least-loaded proxy that still has capacity
    pub async fn borrow(&self) -> Result<Option<ProxyConfig>> {
        self.request(|respond_to| PoolCommand::Borrow { respond_to })
            .await
    }

    /// Return a borrowed proxy
    ///
    /// `had_error` counts against the proxy's error budget; the proxy is
    /// evicted once the budget is spent. Returning an unknown or already
    /// evicted proxy does nothing.
    pub async fn give_back(&self, proxy: &ProxyConfig, had_error: bool) -> Result<()> {
        let address = proxy.address.clone();
        self.request(|respond_to| PoolCommand::GiveBack {
            address,
            had_error,
            respond_to,
        })
        .await
    }

    /// Current proxy list
    pub async fn list(&self) -> Result<Vec<ProxyConfig>> {
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .map(|entry| entry.proxy)
            .collect())
    }

    /// Current proxy list with load and error counters
    pub async fn snapshot(&self) -> Result<Vec<ProxyEntry>> {
        self.request(|respond_to| PoolCommand::Snapshot { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(build(respond_to))
            .await
            .map_err(|_| Error::ProxyPoolClosed)?;
        rx.await.map_err(|_| Error::ProxyPoolClosed)
    }
}

async fn run_worker(
    mut state: PoolState,
    path: Option<PathBuf>,
    mut rx: mpsc::Receiver<PoolCommand>,
) {
    while let Some(command) = rx.recv().await {
        let changed = match command {
            PoolCommand::Add { proxy, respond_to } => {
                let address = proxy.address.clone();
                let added = state.add(proxy);
                if added {
                    info!(address = %address, "Proxy added");
                } else {
                    debug!(address = %address, "Proxy already pooled");
                }
                let _ = respond_to.send(added);
                added
            }
            PoolCommand::Remove {
                address,
                respond_to,
            } => {
                let removed = state.remove(&address);
                if removed.is_some() {
                    info!(address = %address, "Proxy removed");
                }
                let changed = removed.is_some();
                let _ = respond_to.send(removed);
                changed
            }
            PoolCommand::Borrow { respond_to } => {
                let borrowed = state.borrow();
                if let Some(proxy) = &borrowed {
                    debug!(address = %proxy.address, "Proxy borrowed");
                }
                let _ = respond_to.send(borrowed);
                false
            }
            PoolCommand::GiveBack {
                address,
                had_error,
                respond_to,
            } => {
                let returned = state.give_back(&address, had_error);
                match returned {
                    Returned::Evicted => {
                        warn!(address = %address, "Proxy reached its error limit, evicted")
                    }
                    Returned::Kept if had_error => {
                        warn!(address = %address, "Proxy returned with an error")
                    }
                    Returned::Kept => debug!(address = %address, "Proxy returned"),
                    Returned::Unknown => debug!(address = %address, "Ignoring return of unknown proxy"),
                }
                let _ = respond_to.send(());
                returned == Returned::Evicted
            }
            PoolCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(state.snapshot());
                false
            }
        };

        if changed {
            if let Some(path) = &path {
                if let Err(e) = store::save(path, &state.list()).await {
                    warn!(path = %path.display(), error = %e, "Failed to persist proxy list");
                }
            }
        }
    }

    debug!("Proxy pool worker stopped");
}
