use crate::proxy::state::ProxyEntry;
use crate::types::ProxyConfig;
use tokio::sync::oneshot;

/// Messages consumed by the proxy pool worker.
#[derive(Debug)]
pub(crate) enum PoolCommand {
    /// Insert a proxy unless its address is already known.
    Add {
        proxy: ProxyConfig,
        respond_to: oneshot::Sender<bool>,
    },
    /// Remove the proxy with the given address.
    Remove {
        address: String,
        respond_to: oneshot::Sender<Option<ProxyConfig>>,
    },
    /// Take the least-loaded proxy with spare capacity.
    Borrow {
        respond_to: oneshot::Sender<Option<ProxyConfig>>,
    },
    /// Return a borrowed proxy, reporting whether it broke the attempt.
    GiveBack {
        address: String,
        had_error: bool,
        respond_to: oneshot::Sender<()>,
    },
    /// Snapshot of every entry with its counters.
    Snapshot {
        respond_to: oneshot::Sender<Vec<ProxyEntry>>,
    },
}
