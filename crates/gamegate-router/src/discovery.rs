//! Service discovery collaborator
//!
//! The router and the outbound RPC pool learn about backend instances through
//! [`ServiceDiscovery`]. Membership changes are published as
//! [`DiscoveryEvent`]s so consumers can rebuild their view incrementally.
//! [`StaticDiscovery`] is the in-process implementation used for statically
//! configured deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use gamegate_core::error::{Result, RoutingError};
use gamegate_core::types::{InstanceHealth, ServiceInstance};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Maximum number of events buffered per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A membership or health change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// New instance, or an existing instance whose address/weight/health changed
    Registered(ServiceInstance),
    Deregistered {
        service_name: String,
        instance_id: String,
    },
}

/// Backend instance registry consumed by the router and RPC pool.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Registers or updates an instance.
    async fn register(&self, instance: ServiceInstance) -> Result<()>;

    /// Removes an instance. Removing an unknown instance is not an error.
    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()>;

    /// All known instances of a service, including unhealthy ones.
    async fn list(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// Routable instances of a service.
    async fn list_healthy(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .list(service_name)
            .await?
            .into_iter()
            .filter(|i| i.health.is_routable())
            .collect())
    }

    /// Names of every service with at least one registered instance.
    async fn services(&self) -> Result<Vec<String>>;

    /// Subscribes to membership changes made after this call.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// In-memory discovery registry.
pub struct StaticDiscovery {
    services: DashMap<String, BTreeMap<String, ServiceInstance>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services: DashMap::new(),
            events,
        }
    }

    /// Builds a registry pre-populated with `instances`.
    pub fn with_instances(instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        let discovery = Self::new();
        for instance in instances {
            discovery
                .services
                .entry(instance.service_name.clone())
                .or_default()
                .insert(instance.instance_id.clone(), instance);
        }
        discovery
    }

    /// Updates the health of a registered instance.
    pub fn set_health(
        &self,
        service_name: &str,
        instance_id: &str,
        health: InstanceHealth,
    ) -> Result<()> {
        let updated = {
            let mut members = self.services.get_mut(service_name).ok_or_else(|| {
                RoutingError::UnknownService {
                    service: service_name.to_string(),
                }
            })?;
            let instance = members.get_mut(instance_id).ok_or_else(|| {
                RoutingError::NoInstanceAvailable {
                    service: service_name.to_string(),
                    hops: 0,
                }
            })?;
            instance.health = health;
            instance.clone()
        };

        info!(
            service = %service_name,
            instance = %instance_id,
            health = %health,
            "Instance health changed"
        );
        let _ = self.events.send(DiscoveryEvent::Registered(updated));
        Ok(())
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        debug!(
            service = %instance.service_name,
            instance = %instance.instance_id,
            address = %instance.address,
            "Registering instance"
        );
        self.services
            .entry(instance.service_name.clone())
            .or_default()
            .insert(instance.instance_id.clone(), instance.clone());
        // no subscribers is fine
        let _ = self.events.send(DiscoveryEvent::Registered(instance));
        Ok(())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let removed = self
            .services
            .get_mut(service_name)
            .and_then(|mut members| members.remove(instance_id))
            .is_some();
        self.services.remove_if(service_name, |_, members| members.is_empty());

        if removed {
            debug!(service = %service_name, instance = %instance_id, "Deregistered instance");
            let _ = self.events.send(DiscoveryEvent::Deregistered {
                service_name: service_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(service_name)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn services(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
