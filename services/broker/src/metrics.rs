//! Counters handed to the external metrics sink.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Broker counters.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    pub notifications_dispatched: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub notifications_retried: AtomicU64,
    pub notifications_unrouted: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_inserts: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub clients_evicted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub notifications_dispatched: u64,
    pub notifications_failed: u64,
    pub notifications_retried: u64,
    pub notifications_unrouted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_inserts: u64,
    pub cache_evictions: u64,
    pub clients_evicted: u64,
    pub clients: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copies the counters; `clients` is supplied by the registry.
    pub fn snapshot(&self, clients: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            notifications_dispatched: self.notifications_dispatched.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_retried: self.notifications_retried.load(Ordering::Relaxed),
            notifications_unrouted: self.notifications_unrouted.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_inserts: self.cache_inserts.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
            clients: clients as u64,
        }
    }
}
