//! Observability and Metrics
//!
//! Atomic counters owned by each [`Runtime`](crate::runtime::Runtime). Every
//! worker updates them without locking; `snapshot()` reads a consistent-enough
//! view for logging and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one runtime
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted or opened
    pub connections_total: AtomicU64,
    /// Connections currently attached to the scheduler
    pub connections_active: AtomicU64,
    /// Connections refused because every worker was full
    pub connections_rejected: AtomicU64,
    /// Handshakes that reached `Connected`
    pub handshakes_success: AtomicU64,
    /// Handshakes aborted before `Connected`
    pub handshakes_failed: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total body bytes sent
    pub bytes_sent: AtomicU64,
    /// Total body bytes received
    pub bytes_received: AtomicU64,
    /// Remote calls issued locally
    pub rpc_calls: AtomicU64,
    /// Remote calls answered with a failed result
    pub rpc_failures: AtomicU64,
    /// Results dropped because the call was cancelled or unknown
    pub rpc_results_discarded: AtomicU64,
    /// Objects inserted into the registry
    pub objects_spawned: AtomicU64,
    /// Objects removed from the registry
    pub objects_destroyed: AtomicU64,
    /// Sync var entries applied from the network
    pub sync_var_updates: AtomicU64,
    /// Stream payload bytes sent
    pub stream_bytes_sent: AtomicU64,
    /// Stream payload bytes received
    pub stream_bytes_received: AtomicU64,
    /// Bodies sealed with the session key
    pub encryption_total: AtomicU64,
    /// Bodies that were compressed on send
    pub compression_total: AtomicU64,
    /// Messages dropped or connections closed for protocol violations
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_failures: AtomicU64::new(0),
            rpc_results_discarded: AtomicU64::new(0),
            objects_spawned: AtomicU64::new(0),
            objects_destroyed: AtomicU64::new(0),
            sync_var_updates: AtomicU64::new(0),
            stream_bytes_sent: AtomicU64::new(0),
            stream_bytes_received: AtomicU64::new(0),
            encryption_total: AtomicU64::new(0),
            compression_total: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate: a rejected connection may close without being counted active
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn rpc_call(&self) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_failure(&self) {
        self.rpc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_result_discarded(&self) {
        self.rpc_results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_spawned(&self) {
        self.objects_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_destroyed(&self) {
        self.objects_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_var_update(&self, entries: u64) {
        self.sync_var_updates.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn stream_sent(&self, byte_count: u64) {
        self.stream_bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn stream_received(&self, byte_count: u64) {
        self.stream_bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn encryption(&self) {
        self.encryption_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn compression(&self) {
        self.compression_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            rpc_results_discarded: self.rpc_results_discarded.load(Ordering::Relaxed),
            objects_spawned: self.objects_spawned.load(Ordering::Relaxed),
            objects_destroyed: self.objects_destroyed.load(Ordering::Relaxed),
            sync_var_updates: self.sync_var_updates.load(Ordering::Relaxed),
            stream_bytes_sent: self.stream_bytes_sent.load(Ordering::Relaxed),
            stream_bytes_received: self.stream_bytes_received.load(Ordering::Relaxed),
            encryption_total: self.encryption_total.load(Ordering::Relaxed),
            compression_total: self.compression_total.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            rpc_calls = snapshot.rpc_calls,
            rpc_failures = snapshot.rpc_failures,
            objects_spawned = snapshot.objects_spawned,
            objects_destroyed = snapshot.objects_destroyed,
            sync_var_updates = snapshot.sync_var_updates,
            stream_bytes_sent = snapshot.stream_bytes_sent,
            stream_bytes_received = snapshot.stream_bytes_received,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Runtime metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub rpc_results_discarded: u64,
    pub objects_spawned: u64,
    pub objects_destroyed: u64,
    pub sync_var_updates: u64,
    pub stream_bytes_sent: u64,
    pub stream_bytes_received: u64,
    pub encryption_total: u64,
    pub compression_total: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Logs the elapsed time of an operation when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
    }

    #[test]
    fn test_closed_saturates_at_zero() {
        let metrics = Metrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().connections_active, 0);
    }

    #[test]
    fn test_byte_accounting() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.bytes_received, 7);
    }
}
