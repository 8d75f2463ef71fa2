//! Flat JSON persistence of the proxy list

use crate::Result;
use crate::types::ProxyConfig;
use std::path::Path;

/// Read the persisted list; a missing file is an empty list
pub(crate) async fn load(path: &Path) -> Result<Vec<ProxyConfig>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Replace the persisted list
///
/// Written to a sibling temporary file first and renamed into place so a
/// crash never leaves a truncated list behind.
pub(crate) async fn save(path: &Path, proxies: &[ProxyConfig]) -> Result<()> {
    let json = serde_json::to_vec_pretty(proxies)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
