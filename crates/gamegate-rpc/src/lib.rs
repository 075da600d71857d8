//! # gamegate-rpc
//!
//! Outbound RPC plumbing between the gateway and game backends.
//!
//! - **Channels**: long-lived, multiplexed connections speaking length-delimited
//!   JSON frames, with unary and bidirectional-stream calls
//! - **Pool**: `[min, max]` channels per backend address, round-robin acquire,
//!   probe-driven health with jittered reconnects
//! - **Circuit breakers**: per-target sliding-window failure tracking that
//!   short-circuits calls to a backend that keeps failing
//! - **Backoff**: exponential retry schedule shared by reconnects and dispatch
//!
//! ## Example
//!
//! ```rust,no_run
//! use gamegate_core::{config::RpcPoolConfig, RpcRequest};
//! use gamegate_rpc::{RpcPool, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RpcPoolConfig::default();
//!     let pool = RpcPool::new(TcpConnector::new(config.connect_timeout()), config);
//!     pool.add_address("127.0.0.1:7000").await;
//!
//!     let reply = pool
//!         .call("127.0.0.1:7000", RpcRequest::new("logic", "Move", "payload"))
//!         .await?;
//!     println!("code {}", reply.code);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod channel;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod wire;

pub use backoff::{calculate_backoff, jittered_backoff, retry_with_backoff, BackoffConfig};
pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use channel::{ChannelConnector, FramedChannel, RpcChannel, RpcStream, TcpConnector};
pub use metrics::{BreakerMetrics, RpcPoolCounters, RpcPoolMetrics};
pub use pool::{ChannelInfo, ChannelState, RpcCaller, RpcPool, RpcPoolStats};
pub use server::{serve, serve_connection, RpcService};

// Re-export bytes for convenience
pub use bytes::Bytes;
