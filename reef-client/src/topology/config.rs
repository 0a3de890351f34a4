//! Bucket configuration parsing and the derived node model.
//!
//! Configs arrive as JSON documents, either in a `GET_CONFIG` frame body or
//! on the HTTP streaming endpoint. Parsing prefers the extended node
//! information (`nodesExt`) when present and falls back to the legacy node
//! list field by field.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use reef_core::error::{CoreError, Result};
use reef_core::service::ServiceType;

/// Capability string marking view support; absent on ephemeral buckets.
pub const CAPABILITY_COUCHAPI: &str = "couchapi";

/// How keys are mapped onto nodes for this bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLocator {
    /// Hash partition (vbucket) based placement.
    Vbucket,
    /// Ketama consistent hashing (memcached buckets).
    Ketama,
    /// No key-based placement.
    None,
}

/// A totally ordered config revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ConfigRevision {
    /// Revision epoch; bumps when the cluster is rebuilt.
    pub epoch: u64,
    /// Revision id within the epoch.
    pub rev: u64,
}

impl ConfigRevision {
    /// Creates a revision.
    pub fn new(epoch: u64, rev: u64) -> Self {
        Self { epoch, rev }
    }
}

/// An address advertised for clients on another network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlternateAddress {
    /// Hostname on the alternate network.
    pub hostname: Option<String>,
    /// Plain service ports on the alternate network.
    pub services: HashMap<ServiceType, u16>,
    /// TLS service ports on the alternate network.
    pub tls_services: HashMap<ServiceType, u16>,
}

/// One node of the bucket topology with its reachable services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    hostname: String,
    services: HashMap<ServiceType, u16>,
    tls_services: HashMap<ServiceType, u16>,
    alternate_addresses: HashMap<String, AlternateAddress>,
}

impl NodeInfo {
    /// Creates a node description.
    pub fn new(
        hostname: impl Into<String>,
        services: HashMap<ServiceType, u16>,
        tls_services: HashMap<ServiceType, u16>,
        alternate_addresses: HashMap<String, AlternateAddress>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            services,
            tls_services,
            alternate_addresses,
        }
    }

    /// Returns the node hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the plain service port map.
    pub fn services(&self) -> &HashMap<ServiceType, u16> {
        &self.services
    }

    /// Returns the TLS service port map.
    pub fn ssl_services(&self) -> &HashMap<ServiceType, u16> {
        &self.tls_services
    }

    /// Returns the alternate address map keyed by network name.
    pub fn alternate_addresses(&self) -> &HashMap<String, AlternateAddress> {
        &self.alternate_addresses
    }

    /// Returns the port for a service, preferring TLS when requested.
    pub fn port_for(&self, service: ServiceType, tls: bool) -> Option<u16> {
        if tls {
            self.tls_services.get(&service).copied()
        } else {
            self.services.get(&service).copied()
        }
    }

    /// Returns true if the node exposes the service on either port map.
    pub fn has_service(&self, service: ServiceType) -> bool {
        self.services.contains_key(&service) || self.tls_services.contains_key(&service)
    }
}

/// The vbucket map of a couchbase bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    num_replicas: u32,
    server_list: Vec<String>,
    map: Vec<Vec<i32>>,
}

impl PartitionMap {
    /// Returns the number of partitions.
    pub fn num_partitions(&self) -> u16 {
        self.map.len() as u16
    }

    /// Returns the number of replicas per partition.
    pub fn num_replicas(&self) -> u32 {
        self.num_replicas
    }

    /// Returns the `host:port` entries the map indexes into.
    pub fn server_list(&self) -> &[String] {
        &self.server_list
    }

    /// Returns the server index of the active copy for a partition.
    pub fn active(&self, partition: u16) -> Option<usize> {
        let entry = self.map.get(partition as usize)?;
        match entry.first() {
            Some(index) if *index >= 0 => Some(*index as usize),
            _ => None,
        }
    }

    /// Returns the server index of the nth replica for a partition.
    pub fn replica(&self, partition: u16, replica: u32) -> Option<usize> {
        let entry = self.map.get(partition as usize)?;
        match entry.get(replica as usize + 1) {
            Some(index) if *index >= 0 => Some(*index as usize),
            _ => None,
        }
    }
}

/// A parsed, immutable bucket configuration.
///
/// Configs are replaced wholesale by later revisions; nothing mutates one
/// in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    uuid: String,
    name: String,
    locator: NodeLocator,
    rev: ConfigRevision,
    uri: String,
    streaming_uri: String,
    nodes: Vec<NodeInfo>,
    capabilities: HashSet<String>,
    enabled_services: u8,
    partitions: Option<PartitionMap>,
    origin: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default, rename = "revEpoch")]
    rev_epoch: u64,
    #[serde(default)]
    uuid: String,
    name: String,
    #[serde(default, rename = "nodeLocator")]
    node_locator: Option<String>,
    #[serde(default)]
    uri: String,
    #[serde(default, rename = "streamingUri")]
    streaming_uri: String,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default, rename = "nodesExt")]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default, rename = "bucketCapabilities")]
    bucket_capabilities: Vec<String>,
    #[serde(default, rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawPartitionMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: HashMap<String, u16>,
    #[serde(default, rename = "couchApiBase")]
    couch_api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(default, rename = "alternateAddresses")]
    alternate_addresses: HashMap<String, RawAlternate>,
}

#[derive(Debug, Deserialize)]
struct RawAlternate {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawPartitionMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: u32,
    #[serde(default, rename = "serverList")]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// Maps an extended service key to (service, tls).
fn service_from_key(key: &str) -> Option<(ServiceType, bool)> {
    match key {
        "kv" => Some((ServiceType::Kv, false)),
        "kvSSL" => Some((ServiceType::Kv, true)),
        "capi" => Some((ServiceType::Views, false)),
        "capiSSL" => Some((ServiceType::Views, true)),
        "n1ql" => Some((ServiceType::Query, false)),
        "n1qlSSL" => Some((ServiceType::Query, true)),
        "fts" => Some((ServiceType::Search, false)),
        "ftsSSL" => Some((ServiceType::Search, true)),
        "cbas" => Some((ServiceType::Analytics, false)),
        "cbasSSL" => Some((ServiceType::Analytics, true)),
        "mgmt" => Some((ServiceType::Manager, false)),
        "mgmtSSL" => Some((ServiceType::Manager, true)),
        _ => None,
    }
}

fn split_service_maps(
    raw: &HashMap<String, u16>,
) -> (HashMap<ServiceType, u16>, HashMap<ServiceType, u16>) {
    let mut plain = HashMap::new();
    let mut tls = HashMap::new();
    for (key, port) in raw {
        if let Some((service, is_tls)) = service_from_key(key) {
            if is_tls {
                tls.insert(service, *port);
            } else {
                plain.insert(service, *port);
            }
        }
    }
    (plain, tls)
}

fn strip_port(hostname: &str) -> &str {
    hostname.rsplit_once(':').map(|(h, _)| h).unwrap_or(hostname)
}

impl BucketConfig {
    /// Parses a config JSON document received from `origin`.
    ///
    /// `origin` is the host the document was fetched from; it substitutes
    /// `$HOST` placeholders and is the last hostname fallback for nodes.
    pub fn parse(json: &[u8], origin: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_slice(json)
            .map_err(|e| CoreError::Config(format!("unparseable bucket config: {}", e)))?;

        let capabilities: HashSet<String> = raw
            .bucket_capabilities
            .iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let nodes = if raw.nodes_ext.is_empty() {
            Self::nodes_from_legacy(&raw.nodes, origin)
        } else {
            Self::nodes_from_extended(&raw.nodes_ext, &raw.nodes, &capabilities, origin)
        };

        let mut enabled_services = 0u8;
        for node in &nodes {
            for service in node.services().keys() {
                enabled_services |= 1 << service.bit();
            }
            for service in node.ssl_services().keys() {
                enabled_services |= 1 << service.bit();
            }
        }

        let partitions = raw.vbucket_server_map.map(|raw_map| PartitionMap {
            num_replicas: raw_map.num_replicas,
            server_list: raw_map.server_list,
            map: raw_map.vbucket_map,
        });

        let locator = match raw.node_locator.as_deref() {
            Some("vbucket") => NodeLocator::Vbucket,
            Some("ketama") => NodeLocator::Ketama,
            Some(_) | None => {
                if partitions.is_some() {
                    NodeLocator::Vbucket
                } else {
                    NodeLocator::None
                }
            }
        };

        Ok(Self {
            uuid: raw.uuid,
            name: raw.name,
            locator,
            rev: ConfigRevision::new(raw.rev_epoch, raw.rev),
            uri: raw.uri.replace("$HOST", origin),
            streaming_uri: raw.streaming_uri.replace("$HOST", origin),
            nodes,
            capabilities,
            enabled_services,
            partitions,
            origin: origin.to_string(),
        })
    }

    /// Builds nodes from the extended port info, falling back to the legacy
    /// node at the same index and finally to the origin host.
    fn nodes_from_extended(
        nodes_ext: &[RawNodeExt],
        legacy: &[RawNode],
        capabilities: &HashSet<String>,
        origin: &str,
    ) -> Vec<NodeInfo> {
        let mut converted = Vec::with_capacity(nodes_ext.len());
        for (index, ext) in nodes_ext.iter().enumerate() {
            // The legacy list may be shorter than nodesExt when a service
            // exists cluster-wide but is not enabled for this bucket.
            let legacy_node = legacy.get(index);

            let hostname = match &ext.hostname {
                Some(hostname) => hostname.clone(),
                None => match legacy_node.and_then(|n| n.hostname.as_deref()) {
                    Some(hostname) => strip_port(hostname).to_string(),
                    None => origin.to_string(),
                },
            };

            let (mut services, mut tls_services) = split_service_maps(&ext.services);

            // Ephemeral buckets advertise no view support.
            if !capabilities.contains(CAPABILITY_COUCHAPI) {
                services.remove(&ServiceType::Views);
                tls_services.remove(&ServiceType::Views);
            }

            // Only route data and view traffic to nodes the bucket actually
            // lists; views have historically only worked where kv does.
            if legacy_node.is_none() {
                services.remove(&ServiceType::Kv);
                tls_services.remove(&ServiceType::Kv);
                services.remove(&ServiceType::Views);
                tls_services.remove(&ServiceType::Views);
            }

            let alternate_addresses = ext
                .alternate_addresses
                .iter()
                .map(|(network, alt)| {
                    let (alt_plain, alt_tls) = split_service_maps(&alt.ports);
                    (
                        network.clone(),
                        AlternateAddress {
                            hostname: alt.hostname.clone(),
                            services: alt_plain,
                            tls_services: alt_tls,
                        },
                    )
                })
                .collect();

            converted.push(NodeInfo::new(
                hostname,
                services,
                tls_services,
                alternate_addresses,
            ));
        }
        converted
    }

    /// Builds nodes from the legacy list alone (servers predating extended
    /// port info).
    fn nodes_from_legacy(legacy: &[RawNode], origin: &str) -> Vec<NodeInfo> {
        legacy
            .iter()
            .map(|node| {
                let (hostname, mgmt_port) = match node.hostname.as_deref() {
                    Some(hostname) => {
                        let port = hostname
                            .rsplit_once(':')
                            .and_then(|(_, p)| p.parse().ok())
                            .unwrap_or_else(|| ServiceType::Manager.default_port(false));
                        (strip_port(hostname).to_string(), port)
                    }
                    None => (
                        origin.to_string(),
                        ServiceType::Manager.default_port(false),
                    ),
                };

                let mut services = HashMap::new();
                services.insert(ServiceType::Manager, mgmt_port);
                if let Some(direct) = node.ports.get("direct") {
                    services.insert(ServiceType::Kv, *direct);
                }
                if let Some(base) = &node.couch_api_base {
                    if let Some(port) = url::Url::parse(base).ok().and_then(|u| u.port()) {
                        services.insert(ServiceType::Views, port);
                    }
                }

                NodeInfo::new(hostname, services, HashMap::new(), HashMap::new())
            })
            .collect()
    }

    /// Returns the bucket UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns the bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key placement strategy of this bucket.
    pub fn locator(&self) -> NodeLocator {
        self.locator
    }

    /// Returns the revision of this config.
    pub fn rev(&self) -> ConfigRevision {
        self.rev
    }

    /// Returns the REST URI with `$HOST` resolved.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the streaming URI with `$HOST` resolved.
    pub fn streaming_uri(&self) -> &str {
        &self.streaming_uri
    }

    /// Returns the derived nodes, in config order.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Returns the host this config was fetched from.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns true if the bucket advertises the capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Returns true if any node exposes the service.
    pub fn service_enabled(&self, service: ServiceType) -> bool {
        self.enabled_services & (1 << service.bit()) != 0
    }

    /// Returns the partition map, when the bucket has one.
    pub fn partitions(&self) -> Option<&PartitionMap> {
        self.partitions.as_ref()
    }

    /// Resolves a partition-map server index to a node.
    ///
    /// Entries in the server list are `host:kv-port`; nodes are matched by
    /// hostname and KV port, falling back to hostname alone.
    pub fn node_for_server_index(&self, index: usize) -> Option<&NodeInfo> {
        let entry = self.partitions.as_ref()?.server_list.get(index)?;
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()),
            None => (entry.as_str(), None),
        };

        self.nodes
            .iter()
            .find(|node| {
                node.hostname() == host
                    && port
                        .map(|p| node.port_for(ServiceType::Kv, false) == Some(p))
                        .unwrap_or(true)
            })
            .or_else(|| self.nodes.iter().find(|node| node.hostname() == host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> String {
        r#"{
            "rev": 1073,
            "revEpoch": 1,
            "name": "travel-sample",
            "uuid": "aa61310ca9a9f36e96bbba4d43a7b36c",
            "nodeLocator": "vbucket",
            "uri": "/pools/default/buckets/travel-sample?bucket_uuid=aa6131",
            "streamingUri": "/pools/default/bucketsStreaming/travel-sample?bucket_uuid=aa6131",
            "bucketCapabilities": ["couchapi", "dcp", "xattr", "collections"],
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}},
                {"hostname": "10.0.0.2:8091", "ports": {"direct": 11210}}
            ],
            "nodesExt": [
                {"hostname": "10.0.0.1", "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "capi": 8092, "n1ql": 8093}},
                {"hostname": "10.0.0.2", "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "capi": 8092}}
            ],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, -1]]
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_sample() {
        let config = BucketConfig::parse(sample_config().as_bytes(), "10.0.0.1").unwrap();

        assert_eq!(config.name(), "travel-sample");
        assert_eq!(config.rev(), ConfigRevision::new(1, 1073));
        assert_eq!(config.locator(), NodeLocator::Vbucket);
        assert_eq!(config.nodes().len(), 2);
        assert!(config.service_enabled(ServiceType::Kv));
        assert!(config.service_enabled(ServiceType::Query));
        assert!(!config.service_enabled(ServiceType::Analytics));
        assert_eq!(config.partitions().unwrap().num_partitions(), 4);
    }

    #[test]
    fn test_extended_hostname_fallback_to_legacy() {
        let json = r#"{
            "rev": 1, "name": "b",
            "bucketCapabilities": ["couchapi"],
            "nodes": [{"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}}],
            "nodesExt": [{"services": {"kv": 11210}}]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.2").unwrap();
        assert_eq!(config.nodes()[0].hostname(), "10.0.0.1");
    }

    #[test]
    fn test_extended_hostname_fallback_to_origin() {
        let json = r#"{
            "rev": 1, "name": "b",
            "bucketCapabilities": ["couchapi"],
            "nodes": [],
            "nodesExt": [{"services": {"mgmt": 8091}}]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.2").unwrap();
        assert_eq!(config.nodes()[0].hostname(), "10.0.0.2");
    }

    #[test]
    fn test_ephemeral_bucket_drops_views() {
        let json = r#"{
            "rev": 1, "name": "eph",
            "bucketCapabilities": ["dcp", "xattr"],
            "nodes": [{"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}}],
            "nodesExt": [{"hostname": "10.0.0.1", "services": {"kv": 11210, "capi": 8092, "capiSSL": 18092}}]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.1").unwrap();

        for node in config.nodes() {
            assert!(node.services().get(&ServiceType::Views).is_none());
            assert!(node.ssl_services().get(&ServiceType::Views).is_none());
        }
        assert!(!config.service_enabled(ServiceType::Views));
    }

    #[test]
    fn test_node_without_legacy_entry_drops_kv() {
        let json = r#"{
            "rev": 1, "name": "b",
            "bucketCapabilities": ["couchapi"],
            "nodes": [{"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}}],
            "nodesExt": [
                {"hostname": "10.0.0.1", "services": {"kv": 11210, "capi": 8092}},
                {"hostname": "10.0.0.3", "services": {"kv": 11210, "capi": 8092, "n1ql": 8093}}
            ]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.1").unwrap();

        let tail = &config.nodes()[1];
        assert!(tail.services().get(&ServiceType::Kv).is_none());
        assert!(tail.services().get(&ServiceType::Views).is_none());
        assert_eq!(tail.services().get(&ServiceType::Query), Some(&8093));
    }

    #[test]
    fn test_host_placeholder_replaced() {
        let json = r#"{
            "rev": 1, "name": "b",
            "uri": "/pools/default/b?host=$HOST",
            "streamingUri": "http://$HOST:8091/streaming",
            "nodes": [], "nodesExt": [{"hostname": "n1", "services": {"kv": 11210}}]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "origin.example.com").unwrap();
        assert!(config.uri().contains("host=origin.example.com"));
        assert!(config.streaming_uri().starts_with("http://origin.example.com:8091"));
    }

    #[test]
    fn test_partition_map_lookup() {
        let config = BucketConfig::parse(sample_config().as_bytes(), "10.0.0.1").unwrap();
        let partitions = config.partitions().unwrap();

        assert_eq!(partitions.active(0), Some(0));
        assert_eq!(partitions.active(1), Some(1));
        assert_eq!(partitions.replica(0, 0), Some(1));
        assert_eq!(partitions.replica(3, 0), None);

        let node = config.node_for_server_index(1).unwrap();
        assert_eq!(node.hostname(), "10.0.0.2");
    }

    #[test]
    fn test_legacy_only_config() {
        let json = r#"{
            "rev": 9, "name": "old",
            "nodeLocator": "vbucket",
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}, "couchApiBase": "http://10.0.0.1:8092/old"}
            ]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.1").unwrap();
        let node = &config.nodes()[0];

        assert_eq!(node.hostname(), "10.0.0.1");
        assert_eq!(node.services().get(&ServiceType::Kv), Some(&11210));
        assert_eq!(node.services().get(&ServiceType::Manager), Some(&8091));
        assert_eq!(node.services().get(&ServiceType::Views), Some(&8092));
    }

    #[test]
    fn test_alternate_addresses() {
        let json = r#"{
            "rev": 1, "name": "b",
            "bucketCapabilities": ["couchapi"],
            "nodes": [{"hostname": "10.0.0.1:8091"}],
            "nodesExt": [{
                "hostname": "10.0.0.1",
                "services": {"kv": 11210},
                "alternateAddresses": {
                    "external": {"hostname": "203.0.113.9", "ports": {"kv": 31210, "kvSSL": 31207}}
                }
            }]
        }"#;
        let config = BucketConfig::parse(json.as_bytes(), "10.0.0.1").unwrap();
        let alternate = &config.nodes()[0].alternate_addresses()["external"];

        assert_eq!(alternate.hostname.as_deref(), Some("203.0.113.9"));
        assert_eq!(alternate.services.get(&ServiceType::Kv), Some(&31210));
        assert_eq!(alternate.tls_services.get(&ServiceType::Kv), Some(&31207));
    }

    #[test]
    fn test_revision_ordering() {
        assert!(ConfigRevision::new(1, 5) > ConfigRevision::new(1, 4));
        assert!(ConfigRevision::new(2, 0) > ConfigRevision::new(1, 999));
        assert_eq!(ConfigRevision::new(1, 5), ConfigRevision::new(1, 5));
    }

    #[test]
    fn test_unparseable_config_fails() {
        assert!(BucketConfig::parse(b"{]", "origin").is_err());
    }
}
