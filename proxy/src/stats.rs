//! Process-wide counters. Four monotonic integers plus the in-flight gauge,
//! all mutated with atomic adds so snapshots never need a lock.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use serde::Serialize;

#[derive(Debug)]
pub struct ProxyStats {
    started: Instant,
    total_requests: AtomicU64,
    error_count: AtomicU64,
    total_response_ms: AtomicU64,
    current_connections: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_response_ms: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, elapsed: std::time::Duration) {
        self.total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_response_ms = self.total_response_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests,
            error_count: self.error_count.load(Ordering::Relaxed),
            total_response_ms,
            avg_response_ms: if total_requests > 0 {
                total_response_ms / total_requests
            } else {
                0
            },
            current_connections: self.current_connections.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only projection of the counters, taken atomically per field.
/// Eventually consistent across fields.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub error_count: u64,
    pub total_response_ms: u64,
    pub avg_response_ms: u64,
    pub current_connections: u64,
    pub uptime_seconds: u64,
}
