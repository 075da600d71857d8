//! Error types for the GameGate gateway.
//!
//! Every failure in the pipeline maps onto one variant of [`GatewayError`]. All
//! errors are serializable so they can be logged structurally and turned into the
//! structured error envelopes delivered back to clients; raw backend errors never
//! cross that boundary unwrapped.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using GatewayError as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level error type for all gateway operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// Transport failures; these close the affected connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Authentication and session failures
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Enqueue-time rejections (full, duplicate)
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Routing failures
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Backend call failures
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource exhaustion
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// Only backend call failures are retried by the dispatcher; an open circuit
    /// is explicitly excluded.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Rpc(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error is transient and the condition may clear on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Rpc(e) => e.is_retryable() || matches!(e, RpcError::CircuitOpen { .. }),
            GatewayError::Queue(QueueError::Full { .. }) => true,
            GatewayError::Routing(RoutingError::NoInstanceAvailable { .. }) => true,
            GatewayError::Resource(ResourceError::ConnectionLimit { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this error must close the transport it occurred on.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    /// Stable numeric code carried in structured error envelopes.
    pub fn error_code(&self) -> u32 {
        match self {
            GatewayError::Transport(e) => match e {
                TransportError::ConnectionClosed { .. } => 1001,
                TransportError::FrameTooLarge { .. } => 1002,
                TransportError::MalformedFrame { .. } => 1003,
                TransportError::HeartbeatTimeout { .. } => 1004,
                TransportError::Io { .. } => 1005,
            },
            GatewayError::Auth(e) => match e {
                AuthError::InvalidCredentials { .. } => 2001,
                AuthError::NotAuthenticated => 2002,
                AuthError::SessionNotFound { .. } => 2003,
                AuthError::SessionExpired { .. } => 2004,
            },
            GatewayError::Queue(e) => match e {
                QueueError::Full { .. } => 3001,
                QueueError::Duplicate { .. } => 3002,
                QueueError::RetriesExhausted { .. } => 3003,
                QueueError::Closed => 3004,
            },
            GatewayError::Routing(e) => match e {
                RoutingError::NoInstanceAvailable { .. } => 4001,
                RoutingError::UnknownMessageId { .. } => 4002,
                RoutingError::UnknownService { .. } => 4003,
            },
            GatewayError::Rpc(e) => match e {
                RpcError::CircuitOpen { .. } => 5001,
                RpcError::Timeout { .. } => 5002,
                RpcError::Backend { .. } => 5003,
                RpcError::ChannelUnavailable { .. } => 5004,
                RpcError::ConnectFailed { .. } => 5005,
                RpcError::Protocol { .. } => 5006,
            },
            GatewayError::Config(_) => 6001,
            GatewayError::Resource(_) => 7001,
            GatewayError::Internal(_) => 9999,
        }
    }

    /// Short client-facing description; never includes raw backend detail.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Rpc(RpcError::Backend { code, .. }) => {
                format!("backend rejected the request (code {})", code)
            }
            GatewayError::Rpc(RpcError::Protocol { .. }) | GatewayError::Internal(_) => {
                "internal gateway error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Errors on an ingress transport.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("No activity for {timeout_secs}s")]
    HeartbeatTimeout { timeout_secs: u64 },

    #[error("I/O error ({kind}): {message}")]
    Io { kind: String, message: String },
}

impl TransportError {
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        GatewayError::Transport(err.into())
    }
}

/// Authentication and session lifecycle errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum AuthError {
    #[error("Invalid credentials: {reason}")]
    InvalidCredentials { reason: String },

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session expired: {session_id}")]
    SessionExpired { session_id: String },
}

impl AuthError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            reason: reason.into(),
        }
    }

    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }
}

/// Enqueue-time errors. Non-fatal; the producer decides whether to shed.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum QueueError {
    #[error("Queue {queue} is full ({capacity} entries)")]
    Full { queue: String, capacity: usize },

    #[error("Duplicate message: {dedup_key}")]
    Duplicate { dedup_key: String },

    #[error("Retries exhausted after {retries} attempts")]
    RetriesExhausted { retries: u32 },

    #[error("Queue is closed")]
    Closed,
}

impl QueueError {
    pub fn full(queue: impl Into<String>, capacity: usize) -> Self {
        Self::Full {
            queue: queue.into(),
            capacity,
        }
    }

    pub fn duplicate(dedup_key: impl Into<String>) -> Self {
        Self::Duplicate {
            dedup_key: dedup_key.into(),
        }
    }
}

/// Routing errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum RoutingError {
    #[error("No instance available for service {service} after {hops} hops")]
    NoInstanceAvailable { service: String, hops: usize },

    #[error("No route for message id {message_id}")]
    UnknownMessageId { message_id: u32 },

    #[error("Unknown service: {service}")]
    UnknownService { service: String },
}

impl RoutingError {
    pub fn no_instance(service: impl Into<String>, hops: usize) -> Self {
        Self::NoInstanceAvailable {
            service: service.into(),
            hops,
        }
    }
}

/// Backend call errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum RpcError {
    #[error("Circuit open for {target}")]
    CircuitOpen { target: String },

    #[error("Call to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Backend {target} returned code {code}: {message}")]
    Backend {
        target: String,
        code: i32,
        message: String,
    },

    #[error("No ready channel for {address}")]
    ChannelUnavailable { address: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },
}

impl RpcError {
    pub fn timeout(target: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            target: target.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn unavailable(address: impl Into<String>) -> Self {
        Self::ChannelUnavailable {
            address: address.into(),
        }
    }

    pub fn connect_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns true if the dispatcher should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. }
                | RpcError::Backend { .. }
                | RpcError::ChannelUnavailable { .. }
                | RpcError::ConnectFailed { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Route ranges overlap: {first} and {second}")]
    OverlappingRoutes { first: String, second: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Resource exhaustion errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ResourceError {
    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },

    #[error("Gateway is shutting down")]
    ShuttingDown,
}

/// Extension trait for converting foreign errors into gateway errors.
pub trait ResultExt<T> {
    /// Converts the error to an internal error with context.
    fn internal_context(self, context: &str) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn internal_context(self, context: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Internal(format!("{}: {}", context, e)))
    }
}
