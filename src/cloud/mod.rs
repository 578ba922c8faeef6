//! Cloud network resource model and the collaborator interfaces used to reach it.
//!
//! `types` mirrors the remote resources with explicit optional fields, `client`
//! defines the per-resource CRUD traits, `cache` holds the TTL read-through cache
//! and `store` wraps clients and caches into the calls the reconcilers make.
//! `memory` is an in-process backend used by tests and by the binary's
//! state-file mode.

pub mod cache;
#[cfg(test)]
mod cache_test;
pub mod client;
pub mod memory;
pub mod store;
pub mod types;

pub use cache::{CacheReadType, ResourceCache};
pub use client::{
    CloudClients, ClusterLister, LoadBalancerClient, PrivateLinkServiceClient, PublicIpClient,
    RouteTableClient, SecurityGroupClient, SubnetClient, VmSet, ZoneClient,
};
pub use memory::{InMemoryCloud, StaticClusterLister};
pub use store::ResourceStore;
pub use types::*;
