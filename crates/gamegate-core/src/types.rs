//! Core types for the GameGate gateway.
//!
//! This module defines the fundamental types shared by every stage of the
//! pipeline: connection and session identifiers, the ingress envelope, message
//! priorities, backend service instances and the backend RPC call envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Unique identifier for an ingress connection.
///
/// Wraps a UUID v4 so connection tracking is type-safe across the pool,
/// sessions and the dispatcher's reply path.
///
/// # Examples
///
/// ```
/// use gamegate_core::types::ConnectionId;
///
/// let id = ConnectionId::new();
/// println!("Connection: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

static SESSION_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Unique, time-sortable session identifier.
///
/// The textual form is `<millis:12 hex><seq:4 hex>-<uuid>`; ids minted later sort
/// lexicographically after earlier ones, which keeps the durable store's key
/// space append-friendly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a new session identifier.
    pub fn new() -> Self {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let seq = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Self(format!(
            "{:012x}{:04x}-{}",
            millis & 0xffff_ffff_ffff,
            seq,
            Uuid::new_v4().simple()
        ))
    }

    /// Returns the string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Well-known ingress message ids.
///
/// Ids are partitioned by range: `1..=999` are system messages handled in the
/// gateway's fast path, `9000..=9999` are gateway self-queries, and everything
/// the routing table maps is forwarded to a backend service.
pub mod message_ids {
    /// Client keepalive.
    pub const HEARTBEAT: u32 = 1;
    /// Authenticate and create (or resume) a session.
    pub const AUTH: u32 = 2;
    /// Destroy the current session.
    pub const LOGOUT: u32 = 3;
    /// Rebind an existing session to this connection.
    pub const RESUME: u32 = 4;

    /// Gateway status query.
    pub const GATEWAY_STATUS: u32 = 9001;
    /// Gateway pipeline statistics.
    pub const GATEWAY_STATS: u32 = 9002;
    /// Information about the calling connection.
    pub const GATEWAY_CONNECTION_INFO: u32 = 9003;
    /// Information about the calling session.
    pub const GATEWAY_SESSION_INFO: u32 = 9004;

    pub const SYSTEM_MIN: u32 = 1;
    pub const SYSTEM_MAX: u32 = 999;
    pub const GATEWAY_MIN: u32 = 9000;
    pub const GATEWAY_MAX: u32 = 9999;

    /// High bit set on every response id.
    pub const RESPONSE_FLAG: u32 = 0x8000_0000;
    /// Id carried by structured error envelopes.
    pub const ERROR: u32 = 0xFFFF_FFFF;
}

/// A decoded ingress frame: `{message_id, payload}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: u32,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(message_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }

    /// Builds the response envelope for this request.
    pub fn response(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(self.message_id | message_ids::RESPONSE_FLAG, payload)
    }

    /// Returns true if this envelope is a response or an error.
    pub fn is_response(&self) -> bool {
        self.message_id & message_ids::RESPONSE_FLAG != 0
    }

    /// Builds a structured error envelope referring to `message_id`.
    pub fn error(message_id: u32, error_code: u32, message: impl Into<String>) -> Self {
        let body = ErrorPayload {
            error_code,
            message: message.into(),
            message_id,
        };
        // ErrorPayload has no map keys or non-string floats; encoding cannot fail.
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        Self::new(message_ids::ERROR, payload)
    }

    /// Total encoded size of this envelope on the wire, excluding the length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + self.payload.len()
    }
}

/// JSON body of a structured error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: u32,
    pub message: String,
    pub message_id: u32,
}

/// Message priority.
///
/// Variants are declared from most to least urgent, so the derived ordering has
/// `Critical < High < Normal < Low`; use [`Priority::rank`] when comparing urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric rank, 0 being the most urgent.
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Returns true if `self` is strictly more urgent than `other`.
    pub fn outranks(self, other: Priority) -> bool {
        self.rank() < other.rank()
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Health of a backend instance as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHealth {
    Healthy,
    /// Serving, but should not be preferred.
    Degraded,
    /// Never selected for new traffic.
    Dead,
}

impl InstanceHealth {
    /// Returns true if traffic may be sent to an instance in this state.
    pub fn is_routable(self) -> bool {
        !matches!(self, InstanceHealth::Dead)
    }
}

impl Default for InstanceHealth {
    fn default() -> Self {
        InstanceHealth::Healthy
    }
}

impl fmt::Display for InstanceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceHealth::Healthy => write!(f, "healthy"),
            InstanceHealth::Degraded => write!(f, "degraded"),
            InstanceHealth::Dead => write!(f, "dead"),
        }
    }
}

/// One running process of a backend service, addressable over RPC.
///
/// # Examples
///
/// ```
/// use gamegate_core::types::{InstanceHealth, ServiceInstance};
///
/// let instance = ServiceInstance::builder()
///     .service_name("logic")
///     .instance_id("logic-1")
///     .address("10.0.0.5:7001")
///     .weight(2)
///     .build();
///
/// assert_eq!(instance.health, InstanceHealth::Healthy);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health: InstanceHealth,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            weight: default_weight(),
            health: InstanceHealth::Healthy,
        }
    }

    /// Creates a new builder for ServiceInstance.
    pub fn builder() -> ServiceInstanceBuilder {
        ServiceInstanceBuilder::default()
    }

    pub fn with_health(mut self, health: InstanceHealth) -> Self {
        self.health = health;
        self
    }
}

/// Builder for [`ServiceInstance`].
#[derive(Debug, Default)]
pub struct ServiceInstanceBuilder {
    service_name: Option<String>,
    instance_id: Option<String>,
    address: Option<String>,
    weight: Option<u32>,
    health: Option<InstanceHealth>,
}

impl ServiceInstanceBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn health(mut self, health: InstanceHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Builds the instance; missing fields fall back to empty strings, weight 1
    /// and healthy.
    pub fn build(self) -> ServiceInstance {
        ServiceInstance {
            service_name: self.service_name.unwrap_or_default(),
            instance_id: self.instance_id.unwrap_or_default(),
            address: self.address.unwrap_or_default(),
            weight: self.weight.unwrap_or_else(default_weight),
            health: self.health.unwrap_or_default(),
        }
    }
}

/// Generic backend call envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub service_name: String,
    pub method_name: String,
    pub payload: Bytes,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RpcRequest {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Generic backend reply envelope. `code == 0` means success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Bytes,
}

impl RpcResponse {
    pub const OK: i32 = 0;

    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            code: Self::OK,
            message: String::new(),
            payload: payload.into(),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_sorts_by_creation_time() {
        let first = SessionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SessionId::new();
        assert!(first < second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_response_sets_high_bit() {
        let req = Envelope::new(1001, Bytes::from_static(b"hi"));
        let resp = req.response(Bytes::from_static(b"ok"));
        assert_eq!(resp.message_id, 1001 | message_ids::RESPONSE_FLAG);
        assert!(resp.is_response());
        assert!(!req.is_response());
    }

    #[test]
    fn test_error_envelope_payload() {
        let env = Envelope::error(1001, 4001, "no instance");
        assert_eq!(env.message_id, message_ids::ERROR);
        let body: ErrorPayload = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(body.error_code, 4001);
        assert_eq!(body.message_id, 1001);
        assert_eq!(body.message, "no instance");
    }

    #[test]
    fn test_priority_rank() {
        assert!(Priority::Critical.outranks(Priority::High));
        assert!(Priority::High.outranks(Priority::Low));
        assert!(!Priority::Low.outranks(Priority::Normal));
        assert_eq!(Priority::from_rank(2), Some(Priority::Normal));
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn test_instance_health() {
        assert!(InstanceHealth::Healthy.is_routable());
        assert!(InstanceHealth::Degraded.is_routable());
        assert!(!InstanceHealth::Dead.is_routable());
    }

    #[test]
    fn test_instance_yaml_defaults() {
        let yaml = "service_name: chat\ninstance_id: chat-1\naddress: 127.0.0.1:7002\n";
        let inst: ServiceInstance = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(inst.weight, 1);
        assert_eq!(inst.health, InstanceHealth::Healthy);
    }
}
