//! Process-wide relay counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Global relay metrics collector
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Connections accepted by the transport
    pub connections_accepted: AtomicU64,
    /// Live connections
    pub active_connections: AtomicUsize,
    /// Sessions created
    pub sessions_created: AtomicU64,
    /// Sessions destroyed
    pub sessions_destroyed: AtomicU64,
    /// Payload frames relayed
    pub payloads_relayed: AtomicU64,
    /// Tokens issued over HTTP
    pub tokens_issued: AtomicU64,
    /// Tokens and pending connections that expired unconsumed
    pub pending_expired: AtomicU64,
}

impl RelayMetrics {
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload_relayed(&self) {
        self.payloads_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_issued(&self) {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_expired(&self) {
        self.pending_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            payloads_relayed: self.payloads_relayed.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            pending_expired: self.pending_expired.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: usize,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub payloads_relayed: u64,
    pub tokens_issued: u64,
    pub pending_expired: u64,
}

static GLOBAL_METRICS: LazyLock<RelayMetrics> = LazyLock::new(RelayMetrics::default);

/// Get the global metrics instance
pub fn global_metrics() -> &'static RelayMetrics {
    &GLOBAL_METRICS
}

/// Format a snapshot for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Relay Metrics:\n\
         Connections: {} accepted, {} active\n\
         Sessions: {} created, {} destroyed\n\
         Payloads relayed: {}\n\
         Tokens: {} issued, {} pending expired",
        snapshot.connections_accepted,
        snapshot.active_connections,
        snapshot.sessions_created,
        snapshot.sessions_destroyed,
        snapshot.payloads_relayed,
        snapshot.tokens_issued,
        snapshot.pending_expired,
    )
}
