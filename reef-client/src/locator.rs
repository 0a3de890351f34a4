//! Node selection for outgoing requests.
//!
//! Two placement strategies exist: key-hash (vbucket) placement for the
//! data service, and round-robin over service-enabled nodes for everything
//! else.

use std::sync::atomic::{AtomicUsize, Ordering};

use crc::{Crc, CRC_32_ISO_HDLC};

use reef_core::service::ServiceType;

use crate::topology::{BucketConfig, NodeInfo};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the partition a key hashes to.
///
/// The upper half of the CRC-32 is folded into 15 bits before the modulo,
/// matching the server's placement function.
pub fn partition_for_key(key: &[u8], num_partitions: u16) -> u16 {
    debug_assert!(num_partitions > 0);
    let crc = CRC32.checksum(key);
    (((crc >> 16) & 0x7fff) % u32::from(num_partitions)) as u16
}

/// Key-hash locator for the data service.
#[derive(Debug, Default)]
pub struct KeyValueLocator;

impl KeyValueLocator {
    /// Creates a key-value locator.
    pub fn new() -> Self {
        Self
    }

    /// Resolves the partition and active node for a key.
    ///
    /// Returns `None` when the config has no partition map or the partition
    /// currently has no active owner (mid-rebalance).
    pub fn locate<'a>(
        &self,
        key: &[u8],
        config: &'a BucketConfig,
    ) -> Option<(u16, &'a NodeInfo)> {
        let partitions = config.partitions()?;
        let partition = partition_for_key(key, partitions.num_partitions());
        let server_index = partitions.active(partition)?;
        let node = config.node_for_server_index(server_index)?;
        Some((partition, node))
    }

    /// Resolves the node holding the nth replica of a key's partition.
    pub fn locate_replica<'a>(
        &self,
        key: &[u8],
        replica: u32,
        config: &'a BucketConfig,
    ) -> Option<(u16, &'a NodeInfo)> {
        let partitions = config.partitions()?;
        let partition = partition_for_key(key, partitions.num_partitions());
        let server_index = partitions.replica(partition, replica)?;
        let node = config.node_for_server_index(server_index)?;
        Some((partition, node))
    }
}

/// Round-robin locator for non-KV services.
#[derive(Debug, Default)]
pub struct RoundRobinLocator {
    counter: AtomicUsize,
}

impl RoundRobinLocator {
    /// Creates a round-robin locator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next node with the service enabled.
    pub fn locate<'a>(
        &self,
        service: ServiceType,
        config: &'a BucketConfig,
    ) -> Option<&'a NodeInfo> {
        let eligible: Vec<&NodeInfo> = config
            .nodes()
            .iter()
            .filter(|node| node.has_service(service))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_two_kv_nodes() -> BucketConfig {
        let json = r#"{
            "rev": 1, "name": "b",
            "nodeLocator": "vbucket",
            "bucketCapabilities": ["couchapi"],
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}},
                {"hostname": "10.0.0.2:8091", "ports": {"direct": 11210}}
            ],
            "nodesExt": [
                {"hostname": "10.0.0.1", "services": {"kv": 11210, "n1ql": 8093}},
                {"hostname": "10.0.0.2", "services": {"kv": 11210}}
            ],
            "vBucketServerMap": {
                "numReplicas": 1,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, 0], [0, 1], [1, 0], [0, 1], [1, 0]]
            }
        }"#;
        BucketConfig::parse(json.as_bytes(), "10.0.0.1").unwrap()
    }

    #[test]
    fn test_partition_hash_stable() {
        // Placement must be deterministic across runs.
        let p1 = partition_for_key(b"airline_10", 1024);
        let p2 = partition_for_key(b"airline_10", 1024);
        assert_eq!(p1, p2);
        assert!(p1 < 1024);
    }

    #[test]
    fn test_partition_hash_distributes() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..256 {
            seen.insert(partition_for_key(format!("key-{}", i).as_bytes(), 8));
        }
        // All 8 partitions should be hit by 256 distinct keys.
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_kv_locator_follows_map() {
        let config = config_with_two_kv_nodes();
        let locator = KeyValueLocator::new();

        let (partition, node) = locator.locate(b"some-key", &config).unwrap();
        let expected_index = config.partitions().unwrap().active(partition).unwrap();
        let expected = config.node_for_server_index(expected_index).unwrap();
        assert_eq!(node.hostname(), expected.hostname());
    }

    #[test]
    fn test_kv_locator_replica() {
        let config = config_with_two_kv_nodes();
        let locator = KeyValueLocator::new();

        let (partition, active) = locator.locate(b"some-key", &config).unwrap();
        let (replica_partition, replica) =
            locator.locate_replica(b"some-key", 0, &config).unwrap();
        assert_eq!(partition, replica_partition);
        assert_ne!(active.hostname(), replica.hostname());
    }

    #[test]
    fn test_round_robin_rotates() {
        let config = config_with_two_kv_nodes();
        let locator = RoundRobinLocator::new();

        let first = locator.locate(ServiceType::Kv, &config).unwrap().hostname().to_string();
        let second = locator.locate(ServiceType::Kv, &config).unwrap().hostname().to_string();
        let third = locator.locate(ServiceType::Kv, &config).unwrap().hostname().to_string();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_round_robin_filters_by_service() {
        let config = config_with_two_kv_nodes();
        let locator = RoundRobinLocator::new();

        // Only the first node runs the query service.
        for _ in 0..4 {
            let node = locator.locate(ServiceType::Query, &config).unwrap();
            assert_eq!(node.hostname(), "10.0.0.1");
        }
    }

    #[test]
    fn test_no_eligible_node() {
        let config = config_with_two_kv_nodes();
        let locator = RoundRobinLocator::new();
        assert!(locator.locate(ServiceType::Analytics, &config).is_none());
    }
}
