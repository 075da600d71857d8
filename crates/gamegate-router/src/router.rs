//! Message router
//!
//! Maps an ingress message to a backend instance in two steps: the static
//! [`RouteTable`] picks the service from the message id, then the service's
//! [`ConsistentHashRing`] picks the instance from the routing key. Resolutions
//! are cached; rings are swapped atomically so readers never observe a
//! half-built ring.

use crate::cache::{CacheLookup, RouteCache};
use crate::discovery::{DiscoveryEvent, ServiceDiscovery};
use crate::metrics::{RouterMetrics, RouterStats};
use crate::ring::ConsistentHashRing;
use crate::table::{MessageClass, RouteTable};
use arc_swap::ArcSwap;
use gamegate_core::config::RoutingConfig;
use gamegate_core::error::{Result, RoutingError};
use gamegate_core::types::ServiceInstance;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type RingSet = HashMap<String, Arc<ConsistentHashRing>>;

/// A resolved destination.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub service: Arc<str>,
    pub instance: Arc<ServiceInstance>,
    /// Ring positions skipped before a routable instance was found
    pub hops: usize,
    pub cached: bool,
}

/// Routes messages to backend instances.
pub struct MessageRouter {
    table: RouteTable,
    rings: ArcSwap<RingSet>,
    /// Authoritative membership; writers serialize on this lock
    membership: Mutex<HashMap<String, BTreeMap<String, ServiceInstance>>>,
    cache: RouteCache,
    config: RoutingConfig,
    metrics: Arc<RouterMetrics>,
}

impl MessageRouter {
    pub fn new(config: RoutingConfig) -> Result<Self> {
        let table = RouteTable::from_config(&config)?;
        Ok(Self {
            table,
            rings: ArcSwap::from_pointee(RingSet::new()),
            membership: Mutex::new(HashMap::new()),
            cache: RouteCache::new(config.cache_capacity, config.cache_ttl()),
            config,
            metrics: Arc::new(RouterMetrics::new()),
        })
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Classifies a message id into system, business or gateway.
    pub fn classify(&self, message_id: u32) -> Result<MessageClass> {
        self.table
            .classify(message_id)
            .ok_or_else(|| RoutingError::UnknownMessageId { message_id }.into())
    }

    /// Resolves the instance that should receive traffic for `routing_key`.
    ///
    /// The cached owner is used when it is still a routable member of the
    /// current ring. Otherwise the ring is walked clockwise from the key's
    /// position, skipping instances that are not routable, for at most
    /// `max_hops` extra positions.
    pub fn resolve(&self, service: &str, routing_key: &str) -> Result<ResolvedRoute> {
        self.metrics.record_route();

        let rings = self.rings.load();
        let Some(ring) = rings.get(service).filter(|r| !r.is_empty()) else {
            self.metrics.record_failed_route();
            return Err(RoutingError::no_instance(service, 0).into());
        };

        if let CacheLookup::Hit(instance_id) = self.cache.get(service, routing_key) {
            match ring.instance(&instance_id) {
                Some(instance) if instance.health.is_routable() => {
                    self.metrics.record_cache_hit();
                    trace!(service = %service, key = %routing_key, instance = %instance_id, "Route cache hit");
                    return Ok(ResolvedRoute {
                        service: Arc::from(service),
                        instance: Arc::clone(instance),
                        hops: 0,
                        cached: true,
                    });
                }
                _ => {
                    // owner left the ring or went dead after this entry was written
                    self.cache.remove(service, routing_key);
                }
            }
        }
        self.metrics.record_cache_miss();

        let max_candidates = self.config.max_hops + 1;
        let mut tried = 0;
        for (hops, candidate) in ring.successors(routing_key).take(max_candidates).enumerate() {
            tried = hops + 1;
            if !candidate.health.is_routable() {
                continue;
            }
            if hops == 0 {
                self.cache
                    .insert(service, routing_key, &candidate.instance_id);
            } else {
                debug!(
                    service = %service,
                    key = %routing_key,
                    instance = %candidate.instance_id,
                    hops,
                    "Resolved via failover"
                );
            }
            self.metrics.record_failover_hops(hops);
            return Ok(ResolvedRoute {
                service: Arc::from(service),
                instance: Arc::clone(candidate),
                hops,
                cached: false,
            });
        }

        self.metrics.record_failed_route();
        warn!(service = %service, key = %routing_key, tried, "No routable instance");
        Err(RoutingError::no_instance(service, tried).into())
    }

    /// Classifies `message_id` and, for business messages, resolves its instance.
    pub fn route(
        &self,
        message_id: u32,
        routing_key: &str,
    ) -> Result<(MessageClass, Option<ResolvedRoute>)> {
        let class = self.classify(message_id)?;
        let resolved = match class.service() {
            Some(service) => Some(self.resolve(service, routing_key)?),
            None => None,
        };
        Ok((class, resolved))
    }

    /// Adds or updates an instance and rebuilds its service's ring.
    pub fn register_instance(&self, instance: ServiceInstance) {
        let service = instance.service_name.clone();
        let mut membership = self.membership.lock();
        let members = membership.entry(service.clone()).or_default();

        let previous = members.insert(instance.instance_id.clone(), instance.clone());
        if previous.as_ref() == Some(&instance) {
            return;
        }
        let address_changed = previous
            .as_ref()
            .is_some_and(|p| p.address != instance.address);

        self.rebuild_ring(&service, members);
        drop(membership);

        if address_changed {
            let dropped = self.cache.invalidate_instance(&service, &instance.instance_id);
            self.metrics.record_invalidations(dropped);
        }
        info!(
            service = %service,
            instance = %instance.instance_id,
            address = %instance.address,
            health = %instance.health,
            "Instance registered"
        );
    }

    /// Removes an instance, rebuilds the ring and drops exactly the cache
    /// entries that pointed at it. Returns false if it was not registered.
    pub fn deregister_instance(&self, service: &str, instance_id: &str) -> bool {
        let mut membership = self.membership.lock();
        let Some(members) = membership.get_mut(service) else {
            return false;
        };
        if members.remove(instance_id).is_none() {
            return false;
        }

        self.rebuild_ring(service, members);
        if members.is_empty() {
            membership.remove(service);
        }
        drop(membership);

        let dropped = self.cache.invalidate_instance(service, instance_id);
        self.metrics.record_invalidations(dropped);
        info!(
            service = %service,
            instance = %instance_id,
            invalidated = dropped,
            "Instance deregistered"
        );
        true
    }

    /// Builds a new ring from `members` and publishes it. Caller holds the
    /// membership lock.
    fn rebuild_ring(&self, service: &str, members: &BTreeMap<String, ServiceInstance>) {
        let ring = ConsistentHashRing::build(service, members.values(), self.config.virtual_nodes);
        let mut next: RingSet = (**self.rings.load()).clone();
        if ring.is_empty() {
            next.remove(service);
        } else {
            next.insert(service.to_string(), Arc::new(ring));
        }
        self.rings.store(Arc::new(next));
        self.metrics.record_ring_rebuild();
    }

    /// Applies one discovery event.
    pub fn apply_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Registered(instance) => self.register_instance(instance),
            DiscoveryEvent::Deregistered {
                service_name,
                instance_id,
            } => {
                self.deregister_instance(&service_name, &instance_id);
            }
        }
    }

    /// Replaces the membership of every routed service with what `discovery`
    /// currently reports.
    pub async fn sync_from<D: ServiceDiscovery + ?Sized>(&self, discovery: &D) -> Result<()> {
        for service in self.table.services() {
            let listed = discovery.list(&service).await?;
            let stale: Vec<String> = self
                .instances(&service)
                .into_iter()
                .filter(|known| !listed.iter().any(|i| i.instance_id == known.instance_id))
                .map(|known| known.instance_id.clone())
                .collect();

            for instance_id in stale {
                self.deregister_instance(&service, &instance_id);
            }
            for instance in listed {
                self.register_instance(instance);
            }
        }
        Ok(())
    }

    /// Follows discovery events until `cancel` fires. Resynchronizes from
    /// scratch if the subscription lagged.
    pub fn spawn_watcher<D: ServiceDiscovery>(
        self: &Arc<Self>,
        discovery: Arc<D>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut events = discovery.subscribe();

        tokio::spawn(async move {
            if let Err(e) = router.sync_from(discovery.as_ref()).await {
                warn!(error = %e, "Initial discovery sync failed");
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => router.apply_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Discovery events lagged, resynchronizing");
                            if let Err(e) = router.sync_from(discovery.as_ref()).await {
                                warn!(error = %e, "Discovery resync failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Discovery watcher stopped");
        })
    }

    /// Current members of a service's ring.
    pub fn instances(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.rings
            .load()
            .get(service)
            .map(|ring| ring.instances().cloned().collect())
            .unwrap_or_default()
    }

    /// The ring currently published for `service`.
    pub fn ring(&self, service: &str) -> Option<Arc<ConsistentHashRing>> {
        self.rings.load().get(service).cloned()
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> RouterStats {
        self.metrics.snapshot()
    }
}
