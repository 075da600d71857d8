//! Message routing for the GameGate gateway
//!
//! This crate turns an ingress message into a concrete backend destination:
//!
//! - A static [`table::RouteTable`] partitions message ids into system, gateway
//!   and per-service business ranges
//! - A [`ring::ConsistentHashRing`] per service maps routing keys (usually the
//!   player id) onto instances, so membership changes remap as few keys as possible
//! - A bounded LRU + TTL [`cache::RouteCache`] memoizes resolutions, with
//!   per-instance invalidation on removal
//! - [`discovery::ServiceDiscovery`] feeds membership changes into the router
//!
//! # Consistency
//!
//! Rings are immutable and published through an atomic pointer swap. A reader
//! either sees the ring before a membership change or the ring after it, never
//! a partially rebuilt one. Cached resolutions are re-validated against the
//! current ring on every hit, so an entry never outlives its instance.
//!
//! # Example
//!
//! ```rust
//! use gamegate_core::config::RoutingConfig;
//! use gamegate_core::types::ServiceInstance;
//! use gamegate_router::MessageRouter;
//!
//! let router = MessageRouter::new(RoutingConfig::default()).unwrap();
//! router.register_instance(ServiceInstance::new("logic", "logic-1", "10.0.0.1:7001"));
//! router.register_instance(ServiceInstance::new("logic", "logic-2", "10.0.0.2:7001"));
//!
//! let (class, route) = router.route(1001, "player-42").unwrap();
//! assert_eq!(class.service(), Some("logic"));
//!
//! let route = route.unwrap();
//! let again = router.resolve("logic", "player-42").unwrap();
//! assert_eq!(route.instance.instance_id, again.instance.instance_id);
//! ```

pub mod cache;
pub mod discovery;
pub mod metrics;
pub mod ring;
pub mod router;
pub mod table;

pub use cache::RouteCache;
pub use discovery::{DiscoveryEvent, ServiceDiscovery, StaticDiscovery};
pub use metrics::{RouterMetrics, RouterStats};
pub use ring::ConsistentHashRing;
pub use router::{MessageRouter, ResolvedRoute};
pub use table::{MessageClass, RouteTable};
