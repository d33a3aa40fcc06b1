//! # Load Balancer Module
//!
//! Four backend-selection disciplines over a fixed slice of [`Backend`]s, modelled as a
//! closed enum selected by the upstream's `algorithm` tag.
//!
//! ## Rust Concepts Explained
//!
//! - `AtomicUsize::fetch_add` gives every concurrent caller a distinct counter value, so
//!   round-robin positions are never lost under contention
//! - `parking_lot::Mutex` serializes the least-connections scan with its increment
//! - `Arc<Backend>` lets the selection outlive the borrow of the pool's backend slice
//!
//! ## Load Balancing Algorithms
//!
//! 1. **Round Robin**: counter modulo pool size, then scan forward to the first healthy backend
//! 2. **Weighted Round Robin**: counter modulo the healthy weight sum, mapped onto the weights
//! 3. **IP Hash**: hash of the client IP picks the starting index, then scan forward
//! 4. **Least Connections**: healthy backend with the fewest in-flight requests
//!
//! Every strategy skips unhealthy backends while at least one healthy backend exists. When
//! the whole pool is unhealthy they all fall back to the first backend, ignoring health.
//! Selection fails only on an empty pool.

use http::HeaderMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::config::Algorithm;
use crate::core::types::client_ip;
use crate::load_balancing::backend::{Backend, ConnectionLease};

/// Outcome of a selection.
///
/// For least-connections the lease holds the backend's in-flight slot; dropping the
/// selection releases it.
#[derive(Debug)]
pub struct Selection {
    pub backend: Arc<Backend>,
    pub lease: Option<ConnectionLease>,
}

impl Selection {
    fn plain(backend: &Arc<Backend>) -> Self {
        Self {
            backend: Arc::clone(backend),
            lease: None,
        }
    }

    pub fn addr(&self) -> &str {
        self.backend.addr()
    }
}

#[derive(Debug)]
pub enum LoadBalancer {
    RoundRobin(RoundRobin),
    WeightedRoundRobin(WeightedRoundRobin),
    IpHash(IpHash),
    LeastConnections(LeastConnections),
}

impl LoadBalancer {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::RoundRobin => Self::RoundRobin(RoundRobin::default()),
            Algorithm::WeightedRoundRobin => Self::WeightedRoundRobin(WeightedRoundRobin::default()),
            Algorithm::IpHash => Self::IpHash(IpHash),
            Algorithm::LeastConn => Self::LeastConnections(LeastConnections::default()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::RoundRobin(_) => Algorithm::RoundRobin,
            Self::WeightedRoundRobin(_) => Algorithm::WeightedRoundRobin,
            Self::IpHash(_) => Algorithm::IpHash,
            Self::LeastConnections(_) => Algorithm::LeastConn,
        }
    }

    /// Pick a backend for one request. `None` only when `backends` is empty.
    pub fn next(
        &self,
        backends: &[Arc<Backend>],
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
    ) -> Option<Selection> {
        if backends.is_empty() {
            return None;
        }
        let selection = match self {
            Self::RoundRobin(rr) => rr.select(backends),
            Self::WeightedRoundRobin(wrr) => wrr.select(backends),
            Self::IpHash(hash) => {
                let key = client_ip(headers, remote).unwrap_or_default();
                hash.select(backends, &key)
            }
            Self::LeastConnections(lc) => lc.select(backends),
        };
        Some(selection)
    }
}

/// First healthy backend scanning forward (with wrap-around) from `start`
fn scan_healthy(backends: &[Arc<Backend>], start: usize) -> Option<&Arc<Backend>> {
    let len = backends.len();
    (0..len)
        .map(|offset| &backends[(start + offset) % len])
        .find(|backend| backend.is_healthy())
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Selection {
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();
        let backend = scan_healthy(backends, start).unwrap_or(&backends[0]);
        Selection::plain(backend)
    }
}

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Selection {
        let total: u64 = backends
            .iter()
            .filter(|b| b.is_healthy())
            .map(|b| u64::from(b.weight()))
            .sum();
        if total == 0 {
            return Selection::plain(&backends[0]);
        }

        let mut position = (self.counter.fetch_add(1, Ordering::Relaxed) as u64 % total) as i64;
        for backend in backends.iter().filter(|b| b.is_healthy()) {
            position -= i64::from(backend.weight());
            if position < 0 {
                return Selection::plain(backend);
            }
        }
        // Health changed between summing and walking
        let backend = scan_healthy(backends, 0).unwrap_or(&backends[0]);
        Selection::plain(backend)
    }
}

#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    fn select(&self, backends: &[Arc<Backend>], client: &str) -> Selection {
        let digest = Sha256::digest(client.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let start = (u64::from_be_bytes(prefix) % backends.len() as u64) as usize;

        let backend = scan_healthy(backends, start).unwrap_or(&backends[0]);
        Selection::plain(backend)
    }
}

#[derive(Debug, Default)]
pub struct LeastConnections {
    guard: Mutex<()>,
}

impl LeastConnections {
    fn select(&self, backends: &[Arc<Backend>]) -> Selection {
        let _scan = self.guard.lock();
        let backend = backends
            .iter()
            .filter(|b| b.is_healthy())
            .min_by_key(|b| b.in_flight())
            .unwrap_or(&backends[0]);

        Selection {
            backend: Arc::clone(backend),
            lease: Some(backend.acquire()),
        }
    }
}
