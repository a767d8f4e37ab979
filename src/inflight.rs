//! Tracking of domains currently being resolved through the tunnel.
//!
//! At most one tunnel lookup runs per domain. A query that arrives while its
//! domain is in flight is dropped; the requester's own retry will hit the
//! cache once the first lookup lands.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashSet;

/// Shared set of in-flight domains.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    domains: Arc<Mutex<FxHashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `domain` for resolution.
    ///
    /// Returns a guard that releases the claim when dropped, or `None` when
    /// another resolution for the same domain is already running.
    pub fn try_begin(&self, domain: &str) -> Option<InFlightGuard> {
        let inserted = self.lock().insert(domain.to_string());
        inserted.then(|| InFlightGuard {
            tracker: self.clone(),
            domain: domain.to_string(),
        })
    }

    /// Release `domain`.
    pub fn end(&self, domain: &str) {
        self.lock().remove(domain);
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.lock().contains(domain)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashSet<String>> {
        self.domains.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim on one in-flight domain, released exactly once on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: InFlight,
    domain: String,
}

impl InFlightGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.end(&self.domain);
    }
}
