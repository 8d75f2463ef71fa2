//! Source-address rotation
//!
//! Cycles through every address of the configured blocks, wrapping
//! around to the first block once the last is exhausted. A producer task
//! computes addresses lazily and hands them over a channel of depth one, so a
//! huge IPv6 block costs nothing until it is drawn from.

use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use std::net::IpAddr;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Endless, restartable sequence of source addresses
pub struct AddressRotator {
    blocks: Vec<IpNet>,
    rx: Mutex<mpsc::Receiver<IpAddr>>,
    producer: JoinHandle<()>,
}

impl AddressRotator {
    /// Start rotating among `blocks`
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(blocks: Vec<IpNet>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(produce(blocks.clone(), tx));

        Self {
            blocks,
            rx: Mutex::new(rx),
            producer,
        }
    }

    /// Configured blocks
    pub fn blocks(&self) -> &[IpNet] {
        &self.blocks
    }

    /// Draw the next address
    ///
    /// Concurrent draws are serialized. Returns `None` once the producer has
    /// stopped, which only happens when no blocks are configured.
    pub async fn next(&self) -> Option<IpAddr> {
        self.rx.lock().await.recv().await
    }
}

impl Drop for AddressRotator {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

async fn produce(blocks: Vec<IpNet>, tx: mpsc::Sender<IpAddr>) {
    loop {
        let mut produced = false;

        for block in &blocks {
            for addr in every_address(block) {
                if tx.send(addr).await.is_err() {
                    return;
                }
                produced = true;
            }
            debug!(%block, "Address block exhausted");
        }

        if !produced {
            warn!(blocks = ?blocks, "No addresses to rotate among, stopping address rotation");
            return;
        }
    }
}

/// Every address of `block`, network and broadcast included
fn every_address(block: &IpNet) -> IpAddrRange {
    match block {
        IpNet::V4(net) => Ipv4AddrRange::new(net.network(), net.broadcast()).into(),
        IpNet::V6(net) => Ipv6AddrRange::new(net.network(), net.broadcast()).into(),
    }
}

/// Tool arguments pinning the attempt to `addr`
pub(crate) fn source_address_args(addr: IpAddr) -> [String; 3] {
    let family = if addr.is_ipv6() {
        "--force-ipv6"
    } else {
        "--force-ipv4"
    };
    [
        family.to_string(),
        "--source-address".to_string(),
        addr.to_string(),
    ]
}
