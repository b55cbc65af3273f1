//! The admission gate: a non-blocking counting semaphore that is the single
//! decision point for whether a chat request is served. There is no queue; a
//! saturated gate rejects immediately.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::stats::ProxyStats;

#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize, stats: Arc<ProxyStats>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            stats,
        }
    }

    /// Attempt a non-blocking acquire. `None` means the caller must reject
    /// with 503 without touching the upstream.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.stats.connection_opened();
        Some(AdmissionPermit {
            _permit: permit,
            stats: self.stats.clone(),
        })
    }
}

/// Holds one admission slot. The in-flight gauge tracks the permit's
/// lifetime, so it is released on every exit path, including panics and
/// client disconnects that drop the response body.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<ProxyStats>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}
