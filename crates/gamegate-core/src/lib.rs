//! # GameGate Core
//!
//! Core types, error handling, and configuration for the GameGate game-server gateway.
//!
//! This crate provides the foundational building blocks shared by the router,
//! the RPC layer and the ingress pipeline:
//!
//! - **Types**: `ConnectionId`, time-sortable `SessionId`, the ingress `Envelope`,
//!   message `Priority`, `ServiceInstance` and the backend `RpcRequest`/`RpcResponse`.
//! - **Errors**: the `GatewayError` taxonomy with stable client-facing error codes.
//! - **Configuration**: YAML + environment configuration with validation, including
//!   the static message-id routing table.
//!
//! ## Example
//!
//! ```
//! use gamegate_core::config::GatewayConfig;
//! use gamegate_core::types::{Envelope, message_ids};
//!
//! let config = GatewayConfig::default();
//! assert!(config.validate().is_ok());
//!
//! let ping = Envelope::new(message_ids::HEARTBEAT, Vec::new());
//! assert!(ping.response(Vec::new()).is_response());
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use types::{
    ConnectionId, Envelope, InstanceHealth, Priority, RpcRequest, RpcResponse, ServiceInstance,
    SessionId,
};
