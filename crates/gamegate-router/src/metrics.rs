//! Router metrics

use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Router metrics collector
#[derive(Debug)]
pub struct RouterMetrics {
    total_routes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failed_routes: AtomicU64,
    failover_hops: AtomicU64,
    ring_rebuilds: AtomicU64,
    invalidations: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        describe_counter!("router_routes_total", "Total route resolutions");
        describe_counter!("router_cache_hits_total", "Route cache hits");
        describe_counter!("router_cache_misses_total", "Route cache misses");
        describe_counter!(
            "router_failed_routes_total",
            "Resolutions that exhausted failover hops"
        );
        describe_counter!(
            "router_failover_hops_total",
            "Ring positions skipped because the instance was not routable"
        );
        describe_counter!("router_ring_rebuilds_total", "Consistent hash ring rebuilds");
        describe_counter!(
            "router_cache_invalidations_total",
            "Cache entries dropped because their instance was removed"
        );
        describe_gauge!("router_cache_hit_ratio", "Route cache hit ratio (0.0 - 1.0)");

        Self {
            total_routes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            failed_routes: AtomicU64::new(0),
            failover_hops: AtomicU64::new(0),
            ring_rebuilds: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn record_route(&self) {
        self.total_routes.fetch_add(1, Ordering::Relaxed);
        counter!("router_routes_total").increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("router_cache_hits_total").increment(1);
        self.publish_hit_ratio();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("router_cache_misses_total").increment(1);
        self.publish_hit_ratio();
    }

    pub fn record_failed_route(&self) {
        self.failed_routes.fetch_add(1, Ordering::Relaxed);
        counter!("router_failed_routes_total").increment(1);
    }

    pub fn record_failover_hops(&self, hops: usize) {
        if hops > 0 {
            self.failover_hops.fetch_add(hops as u64, Ordering::Relaxed);
            counter!("router_failover_hops_total").increment(hops as u64);
        }
    }

    pub fn record_ring_rebuild(&self) {
        self.ring_rebuilds.fetch_add(1, Ordering::Relaxed);
        counter!("router_ring_rebuilds_total").increment(1);
    }

    pub fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
        counter!("router_cache_invalidations_total").increment(count as u64);
    }

    fn publish_hit_ratio(&self) {
        gauge!("router_cache_hit_ratio").set(self.hit_ratio());
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            total_routes: self.total_routes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failed_routes: self.failed_routes.load(Ordering::Relaxed),
            failover_hops: self.failover_hops.load(Ordering::Relaxed),
            ring_rebuilds: self.ring_rebuilds.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cache_hit_ratio: self.hit_ratio(),
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time router statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub total_routes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failed_routes: u64,
    pub failover_hops: u64,
    pub ring_rebuilds: u64,
    pub invalidations: u64,
    pub cache_hit_ratio: f64,
}
