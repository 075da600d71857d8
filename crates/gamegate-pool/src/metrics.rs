//! Metrics Collection and Export
//!
//! Counters are mirrored into atomics so statistics can be served locally
//! (gateway self messages) without scraping the Prometheus endpoint.

use gamegate_core::config::MetricsConfig;
use gamegate_core::types::Priority;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Ingress connection metrics
#[derive(Debug)]
pub struct ConnectionMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    buffer_hits: AtomicU64,
    buffer_misses: AtomicU64,
    idle_reclaimed: AtomicU64,
    peak: AtomicUsize,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        describe_counter!("gateway_connections_accepted_total", "Ingress connections accepted");
        describe_counter!(
            "gateway_connections_rejected_total",
            "Ingress connections rejected at the concurrency limit"
        );
        describe_counter!("gateway_connections_closed_total", "Ingress connections closed");
        describe_counter!(
            "gateway_heartbeat_timeouts_total",
            "Connections closed for missing heartbeats"
        );
        describe_counter!("gateway_frames_in_total", "Frames received from clients");
        describe_counter!("gateway_frames_out_total", "Frames sent to clients");
        describe_gauge!("gateway_connections_active", "Currently open ingress connections");

        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            buffer_hits: AtomicU64::new(0),
            buffer_misses: AtomicU64::new(0),
            idle_reclaimed: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn record_accepted(&self, active: usize) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(active, Ordering::Relaxed);
        counter!("gateway_connections_accepted_total").increment(1);
        gauge!("gateway_connections_active").set(active as f64);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_connections_rejected_total").increment(1);
    }

    pub fn record_closed(&self, active: usize) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_connections_closed_total").increment(1);
        gauge!("gateway_connections_active").set(active as f64);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_heartbeat_timeouts_total").increment(1);
    }

    pub fn record_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_frames_in_total").increment(1);
    }

    pub fn record_frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_frames_out_total").increment(1);
    }

    pub fn record_buffer(&self, reused: bool) {
        if reused {
            self.buffer_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.buffer_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_idle_reclaimed(&self, count: usize) {
        self.idle_reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn heartbeat_timeouts(&self) -> u64 {
        self.heartbeat_timeouts.load(Ordering::Relaxed)
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn buffer_hits(&self) -> u64 {
        self.buffer_hits.load(Ordering::Relaxed)
    }

    pub fn buffer_misses(&self) -> u64 {
        self.buffer_misses.load(Ordering::Relaxed)
    }

    pub fn idle_reclaimed(&self) -> u64 {
        self.idle_reclaimed.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority queue metrics
#[derive(Debug)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    retried: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        describe_counter!("queue_enqueued_total", "Messages admitted to the priority queue");
        describe_counter!("queue_dequeued_total", "Messages handed to the dispatcher");
        describe_counter!("queue_duplicates_total", "Enqueues rejected as duplicates");
        describe_counter!("queue_rejected_total", "Enqueues rejected at capacity");
        describe_counter!("queue_evicted_total", "Pending messages evicted for higher priority");
        describe_counter!("queue_retried_total", "Messages re-admitted for another attempt");
        describe_gauge!("queue_depth", "Pending messages per priority");
        describe_gauge!("queue_usage_ratio", "Queue depth divided by capacity");
        describe_gauge!("queue_throttling", "1 while producers are asked to slow down");

        Self {
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }
    }

    pub fn record_enqueued(&self, priority: Priority) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("queue_enqueued_total", "priority" => priority.to_string()).increment(1);
    }

    pub fn record_dequeued(&self, count: usize) {
        self.dequeued.fetch_add(count as u64, Ordering::Relaxed);
        counter!("queue_dequeued_total").increment(count as u64);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
        counter!("queue_duplicates_total").increment(1);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("queue_rejected_total").increment(1);
    }

    pub fn record_evicted(&self, priority: Priority) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        counter!("queue_evicted_total", "priority" => priority.to_string()).increment(1);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        counter!("queue_retried_total").increment(1);
    }

    pub fn record_depth(&self, depths: &[usize; 4], usage_ratio: f64, throttling: bool) {
        for priority in Priority::ALL {
            gauge!("queue_depth", "priority" => priority.to_string())
                .set(depths[priority.rank() as usize] as f64);
        }
        gauge!("queue_usage_ratio").set(usage_ratio);
        gauge!("queue_throttling").set(if throttling { 1.0 } else { 0.0 });
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch dispatcher metrics
#[derive(Debug)]
pub struct DispatcherMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    latency_micros_sum: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        describe_counter!("dispatch_messages_total", "Messages dispatched to backends");
        describe_counter!("dispatch_failures_total", "Messages whose dispatch failed terminally");
        describe_counter!("dispatch_batches_total", "Backend batch calls issued");
        describe_histogram!("dispatch_latency_seconds", "Per-message dispatch latency");
        describe_histogram!("dispatch_batch_size", "Messages per backend batch call");

        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            latency_micros_sum: AtomicU64::new(0),
        }
    }

    pub fn record_batch(&self, service: &str, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        counter!("dispatch_batches_total", "service" => service.to_string()).increment(1);
        histogram!("dispatch_batch_size").record(size as f64);
    }

    pub fn record_result(&self, service: &str, success: bool, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.latency_micros_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        counter!("dispatch_messages_total", "service" => service.to_string()).increment(1);
        histogram!("dispatch_latency_seconds", "service" => service.to_string())
            .record(latency.as_secs_f64());
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            counter!("dispatch_failures_total", "service" => service.to_string()).increment(1);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn average_latency(&self) -> Duration {
        let total = self.total();
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_micros_sum.load(Ordering::Relaxed) / total)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            1.0
        } else {
            self.success() as f64 / total as f64
        }
    }
}

impl Default for DispatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus exporter
pub struct MetricsExporter {
    config: MetricsConfig,
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// Installs the global recorder and the scrape listener.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Metrics export disabled");
            return Ok(());
        }

        let addr: SocketAddr = self.config.bind_addr.parse()?;
        let builder = PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets_for_metric(
                Matcher::Suffix("latency_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0],
            )?
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0],
            )?
            .set_buckets_for_metric(
                Matcher::Full("dispatch_batch_size".to_string()),
                &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0],
            )?;

        let (recorder, exporter) = builder.build()?;
        self.handle = Some(recorder.handle());
        metrics::set_global_recorder(recorder)
            .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
        tokio::spawn(exporter);

        info!(bind_address = %addr, "Prometheus metrics exporter started");
        Ok(())
    }

    /// Current exposition text, if the exporter is installed.
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_metrics_track_peak() {
        let metrics = ConnectionMetrics::new();
        metrics.record_accepted(1);
        metrics.record_accepted(2);
        metrics.record_closed(1);
        metrics.record_accepted(2);

        assert_eq!(metrics.accepted(), 3);
        assert_eq!(metrics.closed(), 1);
        assert_eq!(metrics.peak(), 2);
    }

    #[test]
    fn test_dispatcher_success_rate() {
        let metrics = DispatcherMetrics::new();
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record_result("logic", true, Duration::from_millis(2));
        metrics.record_result("logic", true, Duration::from_millis(4));
        metrics.record_result("logic", false, Duration::from_millis(6));
        metrics.record_result("chat", true, Duration::from_millis(8));

        assert_eq!(metrics.total(), 4);
        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.success_rate(), 0.75);
        assert_eq!(metrics.average_latency(), Duration::from_millis(5));
    }

    #[test]
    fn test_disabled_exporter_is_noop() {
        let mut exporter = MetricsExporter::new(MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        });
        exporter.init().unwrap();
        assert!(exporter.render().is_none());
    }
}
