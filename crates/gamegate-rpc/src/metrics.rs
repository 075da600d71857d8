//! Metrics for the outbound RPC layer

use crate::breaker::CircuitState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Circuit breaker metrics collector
#[derive(Debug)]
pub struct BreakerMetrics {
    short_circuits: AtomicU64,
    opens: AtomicU64,
}

impl BreakerMetrics {
    pub fn new() -> Self {
        describe_gauge!(
            "rpc_breaker_state",
            "Circuit breaker state per backend (0 closed, 1 open, 2 half-open)"
        );
        describe_counter!(
            "rpc_breaker_short_circuits_total",
            "Calls rejected by an open circuit without a network attempt"
        );
        describe_counter!("rpc_breaker_opens_total", "Closed/HalfOpen to Open transitions");

        Self {
            short_circuits: AtomicU64::new(0),
            opens: AtomicU64::new(0),
        }
    }

    pub fn record_state(&self, target: &str, state: CircuitState) {
        gauge!("rpc_breaker_state", "backend" => target.to_string()).set(state.as_gauge());
    }

    pub fn record_short_circuit(&self, target: &str) {
        self.short_circuits.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_breaker_short_circuits_total", "backend" => target.to_string()).increment(1);
    }

    pub fn record_open(&self, target: &str) {
        self.opens.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_breaker_opens_total", "backend" => target.to_string()).increment(1);
    }

    pub fn short_circuits(&self) -> u64 {
        self.short_circuits.load(Ordering::Relaxed)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }
}

impl Default for BreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC pool metrics collector
#[derive(Debug)]
pub struct RpcPoolMetrics {
    calls: AtomicU64,
    call_errors: AtomicU64,
    acquire_misses: AtomicU64,
    reconnections: AtomicU64,
    health_checks: AtomicU64,
    probe_failures: AtomicU64,
    channels_removed: AtomicU64,
    channels_created: AtomicU64,
}

impl RpcPoolMetrics {
    pub fn new() -> Self {
        describe_counter!("rpc_calls_total", "Backend calls issued");
        describe_counter!("rpc_call_errors_total", "Backend calls that failed");
        describe_counter!(
            "rpc_acquire_misses_total",
            "Acquire attempts that found no ready channel"
        );
        describe_counter!("rpc_reconnections_total", "Channel reconnect attempts");
        describe_counter!("rpc_health_checks_total", "Channel probes executed");
        describe_counter!("rpc_probe_failures_total", "Channel probes that failed");
        describe_counter!("rpc_channels_created_total", "Channels established");
        describe_counter!(
            "rpc_channels_removed_total",
            "Channels removed after exhausting reconnect attempts"
        );
        describe_gauge!("rpc_ready_channels", "Ready channels per backend address");
        describe_histogram!("rpc_call_duration_seconds", "Backend call latency in seconds");

        Self {
            calls: AtomicU64::new(0),
            call_errors: AtomicU64::new(0),
            acquire_misses: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            channels_removed: AtomicU64::new(0),
            channels_created: AtomicU64::new(0),
        }
    }

    pub fn record_call(&self, latency: Duration, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_calls_total").increment(1);
        if !ok {
            self.call_errors.fetch_add(1, Ordering::Relaxed);
            counter!("rpc_call_errors_total").increment(1);
        }
        histogram!("rpc_call_duration_seconds").record(latency.as_secs_f64());
    }

    pub fn record_acquire_miss(&self) {
        self.acquire_misses.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_acquire_misses_total").increment(1);
    }

    pub fn record_reconnect(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_reconnections_total").increment(1);
    }

    pub fn record_health_check(&self, ok: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_health_checks_total").increment(1);
        if !ok {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
            counter!("rpc_probe_failures_total").increment(1);
        }
    }

    pub fn record_channel_created(&self) {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_channels_created_total").increment(1);
    }

    pub fn record_channel_removed(&self) {
        self.channels_removed.fetch_add(1, Ordering::Relaxed);
        counter!("rpc_channels_removed_total").increment(1);
    }

    pub fn record_ready_channels(&self, address: &str, ready: usize) {
        gauge!("rpc_ready_channels", "address" => address.to_string()).set(ready as f64);
    }

    pub fn snapshot(&self) -> RpcPoolCounters {
        RpcPoolCounters {
            calls: self.calls.load(Ordering::Relaxed),
            call_errors: self.call_errors.load(Ordering::Relaxed),
            acquire_misses: self.acquire_misses.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            channels_created: self.channels_created.load(Ordering::Relaxed),
            channels_removed: self.channels_removed.load(Ordering::Relaxed),
        }
    }
}

impl Default for RpcPoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative RPC pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RpcPoolCounters {
    pub calls: u64,
    pub call_errors: u64,
    pub acquire_misses: u64,
    pub reconnections: u64,
    pub health_checks: u64,
    pub probe_failures: u64,
    pub channels_created: u64,
    pub channels_removed: u64,
}
