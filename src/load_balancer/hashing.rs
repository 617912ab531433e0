//! Hash-based strategies: IP hash and consistent hashing.
//!
//! # Consistent hash ring
//! Every backend contributes `virtual_nodes` points keyed `"{address}:{i}"`.
//! A key maps to the first point at or after its hash, wrapping at the end of
//! the ring. Points owned by unhealthy backends are skipped clockwise.
//! The ring is rebuilt whenever the pool generation changes; health flips do
//! not change the ring.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, pool::BackendPool, BalancerError, LoadBalancer};

/// Hash function used to place keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    /// First 8 bytes of SHA-256, big endian.
    #[default]
    Sha256,
    /// 64-bit FNV-1a.
    Fnv1a,
}

impl HashFunction {
    pub fn hash(&self, key: &str) -> u64 {
        match self {
            HashFunction::Sha256 => {
                let digest = Sha256::digest(key.as_bytes());
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&digest[..8]);
                u64::from_be_bytes(bytes)
            }
            HashFunction::Fnv1a => {
                let mut hash = 0xcbf2_9ce4_8422_2325u64;
                for &byte in key.as_bytes() {
                    hash ^= u64::from(byte);
                    hash = hash.wrapping_mul(0x0100_0000_01b3);
                }
                hash
            }
        }
    }
}

/// IP hash: `healthy[hash(key) mod healthy_count]`.
///
/// Stable only while the healthy set is stable. Without a key the first
/// healthy backend is returned.
#[derive(Debug, Default)]
pub struct IpHash {
    hash_function: HashFunction,
}

impl IpHash {
    pub fn new(hash_function: HashFunction) -> Self {
        Self { hash_function }
    }
}

impl LoadBalancer for IpHash {
    fn next_server(&self, pool: &BackendPool, client_key: Option<&str>) -> Option<Arc<Backend>> {
        let healthy = pool.healthy();
        if healthy.is_empty() {
            return None;
        }

        let index = match client_key {
            Some(key) => (self.hash_function.hash(key) % healthy.len() as u64) as usize,
            None => 0,
        };
        Some(Arc::clone(&healthy[index]))
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

#[derive(Debug)]
struct HashRing {
    /// Pool generation this ring was built from.
    generation: u64,
    points: BTreeMap<u64, Arc<Backend>>,
}

impl HashRing {
    fn empty() -> Self {
        Self {
            generation: u64::MAX,
            points: BTreeMap::new(),
        }
    }

    fn build(
        generation: u64,
        backends: &[Arc<Backend>],
        virtual_nodes: u32,
        hash_function: HashFunction,
    ) -> Self {
        let mut points = BTreeMap::new();
        for backend in backends {
            let address = backend.address();
            for i in 0..virtual_nodes {
                let point = hash_function.hash(&format!("{}:{}", address, i));
                points.insert(point, Arc::clone(backend));
            }
        }
        Self { generation, points }
    }

    fn lookup(&self, hash: u64) -> Option<Arc<Backend>> {
        self.points
            .range(hash..)
            .chain(self.points.range(..hash))
            .map(|(_, backend)| backend)
            .find(|backend| backend.is_healthy())
            .cloned()
    }
}

/// Consistent hashing with virtual nodes.
#[derive(Debug)]
pub struct ConsistentHash {
    virtual_nodes: u32,
    hash_function: HashFunction,
    ring: ArcSwap<HashRing>,
}

impl ConsistentHash {
    pub const DEFAULT_VIRTUAL_NODES: u32 = 150;

    pub fn new(virtual_nodes: u32, hash_function: HashFunction) -> Result<Self, BalancerError> {
        if virtual_nodes == 0 {
            return Err(BalancerError::InvalidParameter {
                algorithm: "consistent_hash",
                reason: "virtual_nodes must be at least 1".to_string(),
            });
        }
        Ok(Self {
            virtual_nodes,
            hash_function,
            ring: ArcSwap::from_pointee(HashRing::empty()),
        })
    }

    /// Current ring, rebuilt first if the pool changed since the last build.
    fn ring(&self, pool: &BackendPool) -> Arc<HashRing> {
        let current = self.ring.load_full();
        if current.generation == pool.generation() {
            return current;
        }

        let (generation, backends) = pool.snapshot();
        let rebuilt = Arc::new(HashRing::build(
            generation,
            &backends,
            self.virtual_nodes,
            self.hash_function,
        ));
        tracing::debug!(
            generation,
            backends = backends.len(),
            points = rebuilt.points.len(),
            "Hash ring rebuilt"
        );
        self.ring.store(Arc::clone(&rebuilt));
        rebuilt
    }

    /// Number of ring points owned by each backend id.
    pub fn ring_distribution(&self, pool: &BackendPool) -> HashMap<String, usize> {
        let mut distribution = HashMap::new();
        for backend in self.ring(pool).points.values() {
            *distribution.entry(backend.id.clone()).or_insert(0) += 1;
        }
        distribution
    }
}

impl LoadBalancer for ConsistentHash {
    fn next_server(&self, pool: &BackendPool, client_key: Option<&str>) -> Option<Arc<Backend>> {
        let Some(key) = client_key else {
            return pool.healthy().into_iter().next();
        };
        self.ring(pool).lookup(self.hash_function.hash(key))
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16) -> BackendPool {
        BackendPool::with_backends(
            (0..n).map(|i| Backend::new(format!("b{}", i + 1), "10.0.0.1", 9000 + i, 1).unwrap()),
        )
    }

    fn keys() -> Vec<String> {
        (0..1000).map(|i| format!("192.168.{}.{}", i / 250, i % 250)).collect()
    }

    #[test]
    fn hash_functions_are_deterministic() {
        for f in [HashFunction::Sha256, HashFunction::Fnv1a] {
            assert_eq!(f.hash("10.0.0.1"), f.hash("10.0.0.1"));
            assert_ne!(f.hash("10.0.0.1"), f.hash("10.0.0.2"));
        }
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(HashFunction::Fnv1a.hash(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn ip_hash_is_sticky() {
        let lb = IpHash::new(HashFunction::Sha256);
        let pool = pool(3);
        let first = lb.next_server(&pool, Some("203.0.113.7")).unwrap();
        for _ in 0..20 {
            assert_eq!(lb.next_server(&pool, Some("203.0.113.7")).unwrap().id, first.id);
        }
        assert_eq!(lb.next_server(&pool, None).unwrap().id, "b1");
    }

    #[test]
    fn consistent_hash_same_key_same_backend() {
        let lb = ConsistentHash::new(150, HashFunction::Sha256).unwrap();
        let pool = pool(4);
        for key in keys().iter().take(50) {
            let first = lb.next_server(&pool, Some(key)).unwrap();
            for _ in 0..5 {
                assert_eq!(lb.next_server(&pool, Some(key)).unwrap().id, first.id);
            }
        }
    }

    #[test]
    fn adding_a_backend_moves_few_keys() {
        let lb = ConsistentHash::new(150, HashFunction::Sha256).unwrap();
        let pool = pool(4);
        let keys = keys();

        let before: Vec<String> = keys
            .iter()
            .map(|k| lb.next_server(&pool, Some(k)).unwrap().id.clone())
            .collect();

        pool.add(Backend::new("b5", "10.0.0.1", 9004, 1).unwrap());

        let mut moved = 0;
        for (key, old) in keys.iter().zip(&before) {
            let new = lb.next_server(&pool, Some(key)).unwrap();
            if new.id != *old {
                moved += 1;
                assert_eq!(new.id, "b5", "keys only move to the new backend");
            }
        }
        // Expected share is 1/5; allow generous slack for hash variance.
        assert!(moved > 0);
        assert!(moved <= 300, "moved {} of 1000 keys", moved);
    }

    #[test]
    fn unhealthy_owner_falls_through_clockwise() {
        let lb = ConsistentHash::new(150, HashFunction::Fnv1a).unwrap();
        let pool = pool(3);
        let owner = lb.next_server(&pool, Some("client-42")).unwrap();
        pool.set_health(&owner.id, false);

        let fallback = lb.next_server(&pool, Some("client-42")).unwrap();
        assert_ne!(fallback.id, owner.id);

        pool.set_health(&owner.id, true);
        assert_eq!(lb.next_server(&pool, Some("client-42")).unwrap().id, owner.id);
    }

    #[test]
    fn distribution_and_validation() {
        let lb = ConsistentHash::new(10, HashFunction::Sha256).unwrap();
        let pool = pool(2);
        let distribution = lb.ring_distribution(&pool);
        assert_eq!(distribution.values().sum::<usize>(), 20);
        assert!(ConsistentHash::new(0, HashFunction::Sha256).is_err());
    }
}
