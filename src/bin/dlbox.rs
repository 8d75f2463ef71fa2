//! dlbox server binary

use clap::Parser;
use dlbox::{Config, DownloadBox, run_with_shutdown};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Shared download box server
#[derive(Debug, Parser)]
#[command(name = "dlbox", version, about)]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, env = "DLBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the API server, overriding the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// API key required from clients, overriding the configuration
    #[arg(long, env = "DLBOX_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dlbox=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.api.bind_address = bind;
    }
    if args.api_key.is_some() {
        config.api.api_key = args.api_key;
    }

    let download_box = DownloadBox::new(config).await?;
    run_with_shutdown(download_box).await?;
    Ok(())
}
