//! Static message classification table
//!
//! Partitions the numeric message-id space into system messages, gateway
//! self-queries and business ranges owned by a backend service. The table is
//! built once from configuration and never changes at runtime.

use gamegate_core::config::{RouteRange, RoutingConfig};
use gamegate_core::error::{ConfigError, Result};
use gamegate_core::types::message_ids;
use std::fmt;
use std::sync::Arc;

/// Category of an ingress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageClass {
    /// Handled in the gateway fast path without queuing
    System,
    /// Forwarded to the named backend service
    Business { service: Arc<str> },
    /// Answered by the gateway itself
    Gateway,
}

impl MessageClass {
    pub fn service(&self) -> Option<&str> {
        match self {
            MessageClass::Business { service } => Some(service),
            _ => None,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageClass::System => write!(f, "system"),
            MessageClass::Business { service } => write!(f, "business:{}", service),
            MessageClass::Gateway => write!(f, "gateway"),
        }
    }
}

#[derive(Debug, Clone)]
struct Range {
    start: u32,
    end: u32,
    service: Arc<str>,
}

/// Sorted, non-overlapping id range table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    ranges: Vec<Range>,
}

impl RouteTable {
    /// Builds the table, rejecting invalid or overlapping ranges.
    pub fn new(routes: &[RouteRange]) -> Result<Self> {
        let config = RoutingConfig {
            routes: routes.to_vec(),
            ..RoutingConfig::default()
        };
        config.validate()?;

        let mut ranges: Vec<Range> = routes
            .iter()
            .map(|r| Range {
                start: r.start,
                end: r.end,
                service: Arc::from(r.service.as_str()),
            })
            .collect();
        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }

    pub fn from_config(config: &RoutingConfig) -> Result<Self> {
        if config.routes.is_empty() {
            return Err(ConfigError::invalid("routing.routes", "at least one route is required").into());
        }
        Self::new(&config.routes)
    }

    /// Classifies a message id. Returns `None` for ids no range claims.
    pub fn classify(&self, message_id: u32) -> Option<MessageClass> {
        if (message_ids::SYSTEM_MIN..=message_ids::SYSTEM_MAX).contains(&message_id) {
            return Some(MessageClass::System);
        }
        if (message_ids::GATEWAY_MIN..=message_ids::GATEWAY_MAX).contains(&message_id) {
            return Some(MessageClass::Gateway);
        }

        let idx = self.ranges.partition_point(|r| r.start <= message_id);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        (message_id <= candidate.end).then(|| MessageClass::Business {
            service: Arc::clone(&candidate.service),
        })
    }

    /// Distinct service names in the table, in id order.
    pub fn services(&self) -> Vec<Arc<str>> {
        let mut out: Vec<Arc<str>> = Vec::new();
        for range in &self.ranges {
            if !out.iter().any(|s| s == &range.service) {
                out.push(Arc::clone(&range.service));
            }
        }
        out
    }
}
