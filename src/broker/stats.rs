//! Broker statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of broker activity and current pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connections ever attached
    pub connections_attached: u64,
    /// Connections detached
    pub connections_detached: u64,
    /// Buffers backed by a fresh allocator call
    pub buffers_allocated: u64,
    /// Allocations served from the free pool
    pub buffers_reused: u64,
    /// Buffers returned to the free pool through an explicit release
    pub buffers_released: u64,
    /// Idle buffers evicted back to the allocator
    pub buffers_evicted: u64,
    /// Allocation requests that failed
    pub allocation_failures: u64,
    /// Transfers opened
    pub transfers_started: u64,
    /// Transfers received
    pub transfers_completed: u64,
    /// Transfers expired by timeout or detach
    pub transfers_expired: u64,
    /// Receive requests rejected
    pub receive_rejections: u64,
    /// Live buffers at snapshot time
    pub live_buffers: usize,
    /// Idle buffers at snapshot time
    pub idle_buffers: usize,
    /// Pending transfers at snapshot time
    pub pending_transactions: usize,
    /// Active connections at snapshot time
    pub active_connections: usize,
}

impl BrokerStats {
    /// Fraction of closed transfers that completed (0.0 to 1.0)
    pub fn completion_rate(&self) -> f64 {
        let closed = self.transfers_completed + self.transfers_expired;
        if closed == 0 {
            return 1.0;
        }
        self.transfers_completed as f64 / closed as f64
    }

    /// Fraction of allocations served from the free pool (0.0 to 1.0)
    pub fn reuse_rate(&self) -> f64 {
        let total = self.buffers_allocated + self.buffers_reused;
        if total == 0 {
            return 0.0;
        }
        self.buffers_reused as f64 / total as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "BrokerStats {{ connections: {}/{} active, buffers: {} live/{} idle, \
             allocated: {}, reused: {}, transfers: {} started/{} completed/{} expired, \
             rejected receives: {}, completion: {:.2}% }}",
            self.active_connections,
            self.connections_attached,
            self.live_buffers,
            self.idle_buffers,
            self.buffers_allocated,
            self.buffers_reused,
            self.transfers_started,
            self.transfers_completed,
            self.transfers_expired,
            self.receive_rejections,
            self.completion_rate() * 100.0
        )
    }
}

/// Thread-safe broker counters
#[derive(Debug, Default)]
pub(crate) struct AtomicBrokerStats {
    pub connections_attached: AtomicU64,
    pub connections_detached: AtomicU64,
    pub buffers_allocated: AtomicU64,
    pub buffers_reused: AtomicU64,
    pub buffers_released: AtomicU64,
    pub buffers_evicted: AtomicU64,
    pub allocation_failures: AtomicU64,
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_expired: AtomicU64,
    pub receive_rejections: AtomicU64,
}

impl AtomicBrokerStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Counter snapshot; occupancy gauges are left at zero for the caller
    pub fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            connections_attached: self.connections_attached.load(Ordering::Relaxed),
            connections_detached: self.connections_detached.load(Ordering::Relaxed),
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            buffers_reused: self.buffers_reused.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
            buffers_evicted: self.buffers_evicted.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_expired: self.transfers_expired.load(Ordering::Relaxed),
            receive_rejections: self.receive_rejections.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
