//! Configuration management for the GameGate gateway.
//!
//! This module provides the configuration system for the whole pipeline:
//! - Loading from YAML files
//! - Environment variable overrides (`GAMEGATE__SECTION__FIELD`)
//! - Validation of ranges, capacities and watermarks
//! - The static routing table mapping message-id ranges to services

use crate::error::{ConfigError, Result};
use crate::types::{message_ids, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main gateway configuration.
///
/// # Examples
///
/// ```no_run
/// use gamegate_core::config::GatewayConfig;
///
/// let config = GatewayConfig::from_file("config/gateway.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub rpc_pool: RpcPoolConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration through the `config` crate: the YAML file first,
    /// then `GAMEGATE__*` environment overrides.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            // GAMEGATE__QUEUE__CAPACITY=20000 overrides queue.capacity
            .add_source(
                config::Environment::with_prefix("GAMEGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.pool.validate()?;
        self.routing.validate()?;
        self.queue.validate()?;
        self.dispatcher.validate()?;
        self.breaker.validate()?;
        self.rpc_pool.validate()?;
        self.discovery.validate()?;
        Ok(())
    }
}

fn require_nonzero(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero").into());
    }
    Ok(())
}

/// Ingress listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest accepted frame, length prefix excluded
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Per-connection buffers and heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_buffer_capacity")]
    pub inbound_capacity: usize,

    #[serde(default = "default_buffer_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_buffer_capacity(),
            outbound_capacity: default_buffer_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("connection.inbound_capacity", self.inbound_capacity)?;
        require_nonzero("connection.outbound_capacity", self.outbound_capacity)?;
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::invalid(
                "connection.heartbeat_timeout_ms",
                "must be greater than heartbeat_interval_ms",
            )
            .into());
        }
        Ok(())
    }
}

/// Ingress connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard limit on concurrently open connections
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Buffer sets created at startup
    #[serde(default = "default_preallocate")]
    pub preallocate: usize,

    /// Upper bound on idle buffer sets kept for reuse
    #[serde(default = "default_recycle_limit")]
    pub recycle_limit: usize,

    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_concurrent() -> usize {
    8000
}

fn default_preallocate() -> usize {
    1000
}

fn default_recycle_limit() -> usize {
    10_000
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            preallocate: default_preallocate(),
            recycle_limit: default_recycle_limit(),
            max_idle_secs: default_max_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("pool.max_concurrent", self.max_concurrent)?;
        if self.preallocate > self.recycle_limit {
            return Err(
                ConfigError::invalid("pool.preallocate", "must not exceed recycle_limit").into(),
            );
        }
        Ok(())
    }
}

/// Session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_local_cache_size")]
    pub local_cache_size: usize,

    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Hot sessions are renewed automatically once expiry is this close
    #[serde(default = "default_renewal_threshold_secs")]
    pub renewal_threshold_secs: u64,

    /// Accesses after which a session counts as hot
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: u32,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Floor for the TTL handed to the durable store
    #[serde(default = "default_min_store_ttl_secs")]
    pub min_store_ttl_secs: u64,

    /// Minimum token length accepted by the auth fast path
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

fn default_local_cache_size() -> usize {
    5000
}

fn default_session_ttl_secs() -> u64 {
    30 * 60
}

fn default_renewal_threshold_secs() -> u64 {
    5 * 60
}

fn default_hot_threshold() -> u32 {
    10
}

fn default_min_store_ttl_secs() -> u64 {
    60
}

fn default_min_token_len() -> usize {
    8
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_cache_size: default_local_cache_size(),
            ttl_secs: default_session_ttl_secs(),
            renewal_threshold_secs: default_renewal_threshold_secs(),
            hot_threshold: default_hot_threshold(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            min_store_ttl_secs: default_min_store_ttl_secs(),
            min_token_len: default_min_token_len(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// One entry of the static routing table: `start..=end` goes to `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRange {
    pub start: u32,
    pub end: u32,
    pub service: String,
}

impl RouteRange {
    pub fn new(start: u32, end: u32, service: impl Into<String>) -> Self {
        Self {
            start,
            end,
            service: service.into(),
        }
    }

    pub fn contains(&self, message_id: u32) -> bool {
        (self.start..=self.end).contains(&message_id)
    }

    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start <= end && start <= self.end
    }
}

impl std::fmt::Display for RouteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={} -> {}", self.start, self.end, self.service)
    }
}

/// Router settings and the static routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRange>,

    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Ring positions tried past the first before giving up
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

fn default_routes() -> Vec<RouteRange> {
    vec![
        RouteRange::new(1000, 1999, "logic"),
        RouteRange::new(2000, 2999, "chat"),
        RouteRange::new(3000, 3999, "fight"),
    ]
}

fn default_virtual_nodes() -> usize {
    160
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_hops() -> usize {
    3
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            virtual_nodes: default_virtual_nodes(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_hops: default_max_hops(),
        }
    }
}

impl RoutingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Validates the routing table.
    ///
    /// Ranges must be non-empty, must not overlap each other and must not
    /// intrude on the reserved system or gateway id ranges.
    pub fn validate(&self) -> Result<()> {
        require_nonzero("routing.virtual_nodes", self.virtual_nodes)?;
        require_nonzero("routing.cache_capacity", self.cache_capacity)?;

        for (i, route) in self.routes.iter().enumerate() {
            if route.start > route.end {
                return Err(ConfigError::invalid(
                    format!("routing.routes[{}]", i),
                    format!("start {} is after end {}", route.start, route.end),
                )
                .into());
            }
            if route.service.is_empty() {
                return Err(ConfigError::invalid(
                    format!("routing.routes[{}].service", i),
                    "must not be empty",
                )
                .into());
            }
            if route.overlaps(message_ids::SYSTEM_MIN, message_ids::SYSTEM_MAX)
                || route.overlaps(message_ids::GATEWAY_MIN, message_ids::GATEWAY_MAX)
            {
                return Err(ConfigError::invalid(
                    format!("routing.routes[{}]", i),
                    format!("{} overlaps a reserved range", route),
                )
                .into());
            }
            for other in &self.routes[..i] {
                if route.overlaps(other.start, other.end) {
                    return Err(ConfigError::OverlappingRoutes {
                        first: other.to_string(),
                        second: route.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Priority queue and backpressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,

    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    /// Usage above which producers should shed low-priority traffic
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f64,

    #[serde(default = "default_dedup_window_size")]
    pub dedup_window_size: usize,

    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_low_watermark() -> f64 {
    0.6
}

fn default_drop_threshold() -> f64 {
    0.95
}

fn default_dedup_window_size() -> usize {
    10_000
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            drop_threshold: default_drop_threshold(),
            dedup_window_size: default_dedup_window_size(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl QueueConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("queue.capacity", self.capacity)?;
        require_nonzero("queue.dedup_window_size", self.dedup_window_size)?;
        let ordered = 0.0 <= self.low_watermark
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= self.drop_threshold
            && self.drop_threshold <= 1.0;
        if !ordered {
            return Err(ConfigError::invalid(
                "queue watermarks",
                "expected 0 <= low_watermark < high_watermark <= drop_threshold <= 1",
            )
            .into());
        }
        Ok(())
    }
}

/// Batch dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Batches allowed in flight at once across all destinations
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Method name used for batched forwards
    #[serde(default = "default_batch_method")]
    pub batch_method: String,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_max_inflight_batches() -> usize {
    10
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    2_000
}

fn default_batch_method() -> String {
    "HandleBatch".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_inflight_batches: default_max_inflight_batches(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            batch_method: default_batch_method(),
        }
    }
}

impl DispatcherConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("dispatcher.batch_size", self.batch_size)?;
        require_nonzero("dispatcher.max_inflight_batches", self.max_inflight_batches)?;
        Ok(())
    }
}

/// Per-target circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Number of most recent calls considered when counting failures
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    3
}

fn default_window_size() -> usize {
    100
}

fn default_call_timeout_ms() -> u64 {
    3_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
            window_size: default_window_size(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("breaker.failure_threshold", self.failure_threshold as usize)?;
        require_nonzero("breaker.success_threshold", self.success_threshold as usize)?;
        if self.window_size < self.failure_threshold as usize {
            return Err(ConfigError::invalid(
                "breaker.window_size",
                "must be at least failure_threshold",
            )
            .into());
        }
        Ok(())
    }
}

/// Outbound RPC channel pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcPoolConfig {
    #[serde(default = "default_min_channels")]
    pub min_channels: usize,

    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Consecutive probe failures before a channel is reconnected
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts before a channel is removed
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,

    /// Fraction of each backoff randomised, 0.0 to 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_min_channels() -> usize {
    10
}

fn default_max_channels() -> usize {
    20
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_max_probe_failures() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_initial_backoff_ms() -> u64 {
    1_000
}

fn default_reconnect_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RpcPoolConfig {
    fn default() -> Self {
        Self {
            min_channels: default_min_channels(),
            max_channels: default_max_channels(),
            probe_interval_ms: default_probe_interval_ms(),
            max_probe_failures: default_max_probe_failures(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RpcPoolConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("rpc_pool.max_channels", self.max_channels)?;
        if self.min_channels > self.max_channels {
            return Err(ConfigError::invalid(
                "rpc_pool.min_channels",
                "must not exceed max_channels",
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("rpc_pool.jitter", "must be within 0.0..=1.0").into());
        }
        Ok(())
    }
}

/// Backend instances seeded into the in-memory discovery registry at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.service_name.is_empty()
                || instance.instance_id.is_empty()
                || instance.address.is_empty()
            {
                return Err(ConfigError::invalid(
                    "discovery.instances",
                    "service_name, instance_id and address are required",
                )
                .into());
            }
            if !seen.insert((&instance.service_name, &instance.instance_id)) {
                return Err(ConfigError::invalid(
                    "discovery.instances",
                    format!("duplicate instance {}/{}", instance.service_name, instance.instance_id),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string into a tracing Level; unknown values map to INFO.
    pub fn parse_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus scrape address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: String,
}

fn default_true() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_metrics_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.routes.len(), 3);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
listener:
  bind_addr: "127.0.0.1:7000"
routing:
  routes:
    - { start: 1000, end: 1999, service: logic }
    - { start: 5000, end: 5999, service: guild }
  virtual_nodes: 64
queue:
  capacity: 100
logging:
  level: debug
  format: json
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.listener.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.routing.routes[1].service, "guild");
        assert_eq!(config.routing.virtual_nodes, 64);
        assert_eq!(config.routing.max_hops, 3);
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.parse_level(), Level::DEBUG);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlapping_routes_rejected() {
        let mut config = GatewayConfig::default();
        config.routing.routes.push(RouteRange::new(1500, 2500, "guild"));
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::OverlappingRoutes { .. })
        ));
    }

    #[test]
    fn test_reserved_range_rejected() {
        let mut config = GatewayConfig::default();
        config.routing.routes = vec![RouteRange::new(9000, 9100, "admin")];
        assert!(config.validate().is_err());

        config.routing.routes = vec![RouteRange::new(500, 1500, "logic")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watermark_ordering() {
        let mut config = GatewayConfig::default();
        config.queue.low_watermark = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rpc_pool_bounds() {
        let mut config = GatewayConfig::default();
        config.rpc_pool.min_channels = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = GatewayConfig::from_yaml("queue: [not, a, map]");
        assert!(matches!(
            result,
            Err(GatewayError::Config(ConfigError::InvalidFormat { .. }))
        ));
    }

    #[test]
    fn test_discovery_instances_from_yaml() {
        let yaml = r#"
discovery:
  instances:
    - { service_name: logic, instance_id: logic-1, address: "127.0.0.1:7001" }
    - { service_name: logic, instance_id: logic-1, address: "127.0.0.1:7002" }
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.discovery.instances[0].weight, 1);
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
