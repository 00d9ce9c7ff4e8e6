//! Per-facade counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one facade's activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub allocations: u64,
    pub sends: u64,
    pub receives: u64,
    pub releases: u64,
    /// Lookups answered from the owned-cache
    pub cache_hits: u64,
    /// Lookups that needed a broker query
    pub cache_misses: u64,
    /// Sends the receiver completed
    pub completions: u64,
    /// Sent buffers that came back after their transfer expired
    pub returns: u64,
    /// Incoming transfers that expired before we received them
    pub cancellations: u64,
    /// Owned buffers taken back by the broker
    pub reclaims: u64,
}

impl ClientStats {
    /// Fraction of lookups served from the cache (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicClientStats {
    pub allocations: AtomicU64,
    pub sends: AtomicU64,
    pub receives: AtomicU64,
    pub releases: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub completions: AtomicU64,
    pub returns: AtomicU64,
    pub cancellations: AtomicU64,
    pub reclaims: AtomicU64,
}

impl AtomicClientStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStats {
        ClientStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
        }
    }
}
