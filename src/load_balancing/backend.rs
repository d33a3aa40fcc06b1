//! # Backend State
//!
//! A [`Backend`] is one concrete address inside an upstream pool. It is shared by every
//! request that targets the pool and by the pool's health checker, so its mutable fields
//! are synchronized:
//!
//! - health flag, failure counter and last-check time live behind a `parking_lot::RwLock`
//!   and are written only by the health checker
//! - the in-flight counter is an `AtomicUsize`, written by request tasks through
//!   [`ConnectionLease`]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub healthy: bool,
    pub failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: true,
            failures: 0,
            last_check: None,
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    addr: String,
    weight: u32,
    health: RwLock<HealthState>,
    in_flight: AtomicUsize,
}

impl Backend {
    /// New backends start healthy
    pub fn new<S: Into<String>>(addr: S, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight: weight.max(1),
            health: RwLock::new(HealthState::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.health.read().healthy
    }

    pub fn health(&self) -> HealthState {
        *self.health.read()
    }

    /// Record a successful probe. Returns `true` if the backend was unhealthy before.
    pub fn mark_healthy(&self) -> bool {
        let mut state = self.health.write();
        let recovered = !state.healthy;
        state.healthy = true;
        state.failures = 0;
        state.last_check = Some(Utc::now());
        recovered
    }

    /// Record a failed probe. Returns `true` if the backend was healthy before.
    pub fn mark_unhealthy(&self) -> bool {
        let mut state = self.health.write();
        let lost = state.healthy;
        state.healthy = false;
        state.failures = state.failures.saturating_add(1);
        state.last_check = Some(Utc::now());
        lost
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count one more request against this backend until the lease is dropped
    pub fn acquire(self: &Arc<Self>) -> ConnectionLease {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ConnectionLease {
            backend: Arc::clone(self),
        }
    }
}

/// Scoped in-flight slot on a backend.
///
/// The counter is decremented exactly once, when the lease is dropped. The dispatcher
/// keeps the lease alive until the response body has been fully streamed or abandoned.
#[derive(Debug)]
pub struct ConnectionLease {
    backend: Arc<Backend>,
}

impl ConnectionLease {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let backend = Backend::new("10.0.0.1:80", 1);
        assert!(backend.is_healthy());
        assert!(backend.health().last_check.is_none());

        assert!(backend.mark_unhealthy());
        assert!(!backend.mark_unhealthy());
        let state = backend.health();
        assert!(!state.healthy);
        assert_eq!(state.failures, 2);
        assert!(state.last_check.is_some());

        assert!(backend.mark_healthy());
        assert_eq!(backend.health().failures, 0);
    }

    #[test]
    fn test_lease_releases_once() {
        let backend = Arc::new(Backend::new("10.0.0.1:80", 1));
        let first = backend.acquire();
        let second = backend.acquire();
        assert_eq!(backend.in_flight(), 2);

        drop(first);
        assert_eq!(backend.in_flight(), 1);
        drop(second);
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_zero_weight_is_clamped() {
        assert_eq!(Backend::new("a:1", 0).weight(), 1);
    }
}
