//! In-memory proxy table owned by the pool worker

use crate::types::ProxyConfig;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A proxy together with its live counters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProxyEntry {
    /// Address, capacity and error budget
    pub proxy: ProxyConfig,
    /// Attempts currently using this proxy
    pub load: u32,
    /// Errors recorded since the proxy was added
    pub errors: u32,
}

/// Outcome of returning a proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Returned {
    /// The address is not (or no longer) in the table
    Unknown,
    /// Load decremented
    Kept,
    /// Error budget exhausted, proxy removed
    Evicted,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    entries: Vec<ProxyEntry>,
}

impl PoolState {
    /// Start from a persisted list with zeroed counters
    pub(crate) fn from_list(proxies: Vec<ProxyConfig>) -> Self {
        let mut state = Self::default();
        for proxy in proxies {
            state.add(proxy);
        }
        state
    }

    pub(crate) fn add(&mut self, proxy: ProxyConfig) -> bool {
        if self.position(&proxy.address).is_some() {
            return false;
        }
        self.entries.push(ProxyEntry {
            proxy,
            load: 0,
            errors: 0,
        });
        true
    }

    pub(crate) fn remove(&mut self, address: &str) -> Option<ProxyConfig> {
        self.position(address)
            .map(|idx| self.entries.remove(idx).proxy)
    }

    /// Least-loaded proxy whose load is strictly below its limit
    pub(crate) fn borrow(&mut self) -> Option<ProxyConfig> {
        let entry = self
            .entries
            .iter_mut()
            .filter(|e| e.load < e.proxy.limit)
            .min_by_key(|e| e.load)?;
        entry.load += 1;
        Some(entry.proxy.clone())
    }

    pub(crate) fn give_back(&mut self, address: &str, had_error: bool) -> Returned {
        let Some(idx) = self.position(address) else {
            return Returned::Unknown;
        };

        let entry = &mut self.entries[idx];
        if had_error {
            entry.errors += 1;
            if entry.errors >= entry.proxy.error_limit {
                self.entries.remove(idx);
                return Returned::Evicted;
            }
        }
        entry.load = entry.load.saturating_sub(1);
        Returned::Kept
    }

    pub(crate) fn list(&self) -> Vec<ProxyConfig> {
        self.entries.iter().map(|e| e.proxy.clone()).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<ProxyEntry> {
        self.entries.clone()
    }

    fn position(&self, address: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.proxy.address == address)
    }
}
