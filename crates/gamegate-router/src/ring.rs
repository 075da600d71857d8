//! Consistent hash ring
//!
//! One ring per service. Each instance contributes `virtual_nodes * weight`
//! points; a key maps to the first point at or after its hash, wrapping around
//! the end of the ring. Rings are immutable once built: membership changes
//! produce a new ring which the router swaps in atomically.

use gamegate_core::types::ServiceInstance;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Hash a string onto the ring's u64 space.
///
/// SHA-256 truncated to the first 8 bytes (big-endian) gives a uniform,
/// platform-independent position, so every gateway process builds identical rings.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Immutable consistent hash ring for one service.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    service: String,
    /// Virtual node position -> instance_id
    points: BTreeMap<u64, Arc<str>>,
    instances: HashMap<Arc<str>, Arc<ServiceInstance>>,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Builds a ring for `service` from its instances.
    ///
    /// On an exact position collision the smallest instance_id keeps the point,
    /// independent of insertion order.
    pub fn build<'a, I>(service: impl Into<String>, instances: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = &'a ServiceInstance>,
    {
        let mut points: BTreeMap<u64, Arc<str>> = BTreeMap::new();
        let mut by_id: HashMap<Arc<str>, Arc<ServiceInstance>> = HashMap::new();

        for instance in instances {
            let id: Arc<str> = Arc::from(instance.instance_id.as_str());
            let replicas = virtual_nodes.max(1) * instance.weight.max(1) as usize;

            for i in 0..replicas {
                let position = hash_key(&format!("{}:{}", instance.instance_id, i));
                match points.get(&position) {
                    Some(existing) if existing.as_ref() <= id.as_ref() => {}
                    _ => {
                        points.insert(position, Arc::clone(&id));
                    }
                }
            }
            by_id.insert(id, Arc::new(instance.clone()));
        }

        Self {
            service: service.into(),
            points,
            instances: by_id,
            virtual_nodes,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Looks up an instance of this ring by id.
    pub fn instance(&self, instance_id: &str) -> Option<&Arc<ServiceInstance>> {
        self.instances.get(instance_id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<ServiceInstance>> {
        self.instances.values()
    }

    /// Returns the instance owning `key`'s position, ignoring health.
    pub fn locate(&self, key: &str) -> Option<&Arc<ServiceInstance>> {
        self.successors(key).next()
    }

    /// Walks the ring clockwise from `key`'s position, yielding each distinct
    /// instance once in the order a failover would try them.
    pub fn successors<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Arc<ServiceInstance>> + 'a {
        let hash = hash_key(key);
        let mut seen: HashSet<&'a str> = HashSet::with_capacity(4);
        let limit = self.instances.len();

        self.points
            .range(hash..)
            .chain(self.points.range(..hash))
            .filter_map(move |(_, id)| {
                if seen.len() >= limit || !seen.insert(id.as_ref()) {
                    return None;
                }
                self.instances.get(id.as_ref())
            })
            .take(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (1..=n)
            .map(|i| {
                ServiceInstance::new("logic", format!("instance-{}", i), format!("10.0.0.{}:7000", i))
            })
            .collect()
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_key("player-42"), hash_key("player-42"));
        assert_ne!(hash_key("player-42"), hash_key("player-43"));
    }

    #[test]
    fn test_empty_ring() {
        let ring = ConsistentHashRing::build("logic", &[], 160);
        assert!(ring.is_empty());
        assert!(ring.locate("anything").is_none());
        assert_eq!(ring.successors("anything").count(), 0);
    }

    #[test]
    fn test_locate_is_stable() {
        let ring = ConsistentHashRing::build("logic", &instances(3), 160);
        for i in 0..100 {
            let key = format!("player-{}", i);
            let first = ring.locate(&key).unwrap().instance_id.clone();
            for _ in 0..5 {
                assert_eq!(ring.locate(&key).unwrap().instance_id, first);
            }
        }
    }

    #[test]
    fn test_successors_visit_each_instance_once() {
        let ring = ConsistentHashRing::build("logic", &instances(4), 50);
        let ids: Vec<_> = ring
            .successors("player-7")
            .map(|i| i.instance_id.clone())
            .collect();
        assert_eq!(ids.len(), 4);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(ids[0], ring.locate("player-7").unwrap().instance_id);
    }

    #[test]
    fn test_weight_scales_points() {
        let mut heavy = ServiceInstance::new("logic", "heavy", "a:1");
        heavy.weight = 3;
        let light = ServiceInstance::new("logic", "light", "b:1");
        let ring = ConsistentHashRing::build("logic", &[heavy, light], 100);
        assert_eq!(ring.point_count(), 400);
    }

    #[test]
    fn test_build_order_does_not_matter() {
        let forward = instances(5);
        let mut reverse = forward.clone();
        reverse.reverse();

        let a = ConsistentHashRing::build("logic", &forward, 64);
        let b = ConsistentHashRing::build("logic", &reverse, 64);
        for i in 0..500 {
            let key = format!("k{}", i);
            assert_eq!(
                a.locate(&key).unwrap().instance_id,
                b.locate(&key).unwrap().instance_id
            );
        }
    }

    #[test]
    fn test_removal_only_remaps_keys_of_removed_instance() {
        let all = instances(3);
        let before = ConsistentHashRing::build("logic", &all, 160);
        let remaining: Vec<_> = all
            .iter()
            .filter(|i| i.instance_id != "instance-2")
            .cloned()
            .collect();
        let after = ConsistentHashRing::build("logic", &remaining, 160);

        let mut moved = 0;
        let mut owners: StdHashMap<String, usize> = StdHashMap::new();
        for i in 0..10_000 {
            let key = format!("player-{}", i);
            let old = &before.locate(&key).unwrap().instance_id;
            let new = &after.locate(&key).unwrap().instance_id;
            *owners.entry(old.clone()).or_default() += 1;
            if old != new {
                assert_eq!(old, "instance-2");
                moved += 1;
            }
        }
        assert!(moved <= 4_000, "moved {} keys", moved);
        assert_eq!(moved, owners["instance-2"]);
    }
}
