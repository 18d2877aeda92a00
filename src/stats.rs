use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::ProxyMode;

/// Statistics snapshot of one listener lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStats {
    /// Mode the listener was started in
    pub mode: ProxyMode,
    /// Bound address
    pub local_addr: String,
    /// Total number of accepted connections
    pub accepted: u64,
    /// Currently active connections
    pub active: u64,
    /// Connections that finished, successfully or not
    pub closed: u64,
    /// Standalone connections rejected for lack of a server name
    pub sni_missing: u64,
    /// Failed dials to a destination or upstream proxy
    pub upstream_failures: u64,
    /// Total bytes relayed from clients
    pub bytes_client_to_remote: u64,
    /// Total bytes relayed to clients
    pub bytes_remote_to_client: u64,
    /// When the listener started (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker shared by the accept loop and its connection tasks
#[derive(Debug, Clone)]
pub struct StatsTracker {
    inner: Arc<Counters>,
    mode: ProxyMode,
    local_addr: String,
    start_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    closed: AtomicU64,
    sni_missing: AtomicU64,
    upstream_failures: AtomicU64,
    bytes_client_to_remote: AtomicU64,
    bytes_remote_to_client: AtomicU64,
}

impl StatsTracker {
    pub fn new(mode: ProxyMode, local_addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Counters::default()),
            mode,
            local_addr: local_addr.into(),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Called when a connection is accepted
    pub fn connection_started(&self) {
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Called when a connection task ends
    pub fn connection_ended(&self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
        self.inner.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sni_missing(&self) {
        self.inner.sni_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.inner.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_client_to_remote(&self, bytes: u64) {
        self.inner
            .bytes_client_to_remote
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_remote_to_client(&self, bytes: u64) {
        self.inner
            .bytes_remote_to_client
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> ListenerStats {
        let c = &self.inner;
        ListenerStats {
            mode: self.mode,
            local_addr: self.local_addr.clone(),
            accepted: c.accepted.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            sni_missing: c.sni_missing.load(Ordering::Relaxed),
            upstream_failures: c.upstream_failures.load(Ordering::Relaxed),
            bytes_client_to_remote: c.bytes_client_to_remote.load(Ordering::Relaxed),
            bytes_remote_to_client: c.bytes_remote_to_client.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

/// Decrements the active counter when dropped, so every exit path of a
/// connection task is counted exactly once
pub struct ConnectionGuard {
    tracker: StatsTracker,
}

impl ConnectionGuard {
    pub fn new(tracker: StatsTracker) -> Self {
        tracker.connection_started();
        Self { tracker }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connection_ended();
    }
}
