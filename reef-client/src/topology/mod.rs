//! Cluster topology: bucket configs, node derivation and publication.

mod config;
mod provider;

pub use config::{
    AlternateAddress, BucketConfig, ConfigRevision, NodeInfo, NodeLocator, PartitionMap,
    CAPABILITY_COUCHAPI,
};
pub use provider::ConfigProvider;
