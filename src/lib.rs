//! # dlbox
//!
//! A shared download box: callers submit a URL with tool arguments, the box
//! runs an external downloader (yt-dlp by default) for it, and every caller
//! asking for the same URL and arguments attaches to the same task.
//!
//! ## Features
//! - **Deduplicated tasks** - identical requests share one process and one output
//! - **Retry with classification** - failed attempts are classified from the
//!   tool's log; unavailable videos are not retried
//! - **Egress control** - a proxy pool with capacity limits and eviction, or
//!   rotation through source-address blocks
//! - **Completion actions** - rclone uploads once a download succeeds
//! - **Two surfaces** - an HTTP API and a nonce-multiplexed websocket protocol
//!   (JSON or bincode) with a matching [`RemoteBox`] client
//!
//! ## Quick Start
//!
//! ```no_run
//! use dlbox::{Config, DownloadBox, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let download_box = DownloadBox::new(Config::default()).await?;
//!
//!     // Serve the API until SIGTERM/SIGINT, then clean up
//!     run_with_shutdown(download_box).await?;
//!     Ok(())
//! }
//! ```
//!
//! Talking to a running box:
//!
//! ```no_run
//! use dlbox::{ClientConfig, DownloadRequest, RemoteBox};
//!
//! # async fn example() -> dlbox::Result<()> {
//! let remote = RemoteBox::connect("ws://localhost:6789/connect", ClientConfig::default()).await?;
//! let outcome = remote
//!     .download_with_data(DownloadRequest::new("https://example.com/watch?v=1"))
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Post-completion actions (rclone uploads)
pub mod actions;
/// REST API module
pub mod api;
/// Failure classification from tool logs
pub mod classify;
/// Configuration types
pub mod config;
/// Service wiring
pub mod download_box;
/// Error types
pub mod error;
/// Nonce-multiplexed session protocol
pub mod protocol;
/// Proxy pool
pub mod proxy;
/// Retry logic with exponential backoff
pub mod retry;
/// Source-address rotation
pub mod rotator;
/// Task manager and task lifecycle
pub mod tasks;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::{ClientConfig, Config};
pub use download_box::DownloadBox;
pub use error::{ApiError, Error, ErrorDetail, Result, TaskError, ToHttpStatus};
pub use protocol::{DownloadOutcome, RemoteBox, WireFormat};
pub use proxy::ProxyPool;
pub use rotator::AddressRotator;
pub use tasks::TaskManager;
pub use types::{
    CompletionRequest, DownloadRequest, DownloadResponse, FeatureSet, ListenCondition,
    ProxyConfig, TaskId, TaskInfo, TaskStatus,
};

/// Serve a box until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// If the API server stops on its own, its error is returned after cleanup.
pub async fn run_with_shutdown(download_box: DownloadBox) -> Result<()> {
    let served = tokio::select! {
        served = download_box.serve() => served,
        _ = wait_for_signal() => Ok(()),
    };
    if let Err(e) = &served {
        tracing::error!(error = %e, "API server failed");
    }
    download_box.shutdown().await?;
    served
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
