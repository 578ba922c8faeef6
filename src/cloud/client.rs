//! Collaborator interfaces consumed by the reconcilers.
//!
//! Every read returns `Ok(None)` for a missing resource; writes carry the ETag
//! of the copy they were derived from and fail with
//! [`Error::PreconditionFailed`](crate::Error::PreconditionFailed) when it is stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};

use super::types::{
    BackendAddressPool, LoadBalancer, PrivateLinkService, PublicIpAddress, RouteTable,
    SecurityGroup, Subnet,
};
use crate::error::Result;

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<LoadBalancer>>;
    async fn list(&self, resource_group: &str) -> Result<Vec<LoadBalancer>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        lb: &LoadBalancer,
        etag: Option<&str>,
    ) -> Result<()>;
    /// Write a single backend pool without touching the rest of the load balancer.
    async fn create_or_update_backend_pool(
        &self,
        resource_group: &str,
        lb_name: &str,
        pool: &BackendAddressPool,
    ) -> Result<()>;
    async fn delete(&self, resource_group: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait PublicIpClient: Send + Sync {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<PublicIpAddress>>;
    async fn list(&self, resource_group: &str) -> Result<Vec<PublicIpAddress>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        pip: &PublicIpAddress,
        etag: Option<&str>,
    ) -> Result<()>;
    async fn delete(&self, resource_group: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait SecurityGroupClient: Send + Sync {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<SecurityGroup>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        sg: &SecurityGroup,
        etag: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
pub trait SubnetClient: Send + Sync {
    async fn get(
        &self,
        resource_group: &str,
        vnet_name: &str,
        name: &str,
    ) -> Result<Option<Subnet>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        vnet_name: &str,
        subnet: &Subnet,
    ) -> Result<()>;
}

#[async_trait]
pub trait RouteTableClient: Send + Sync {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<RouteTable>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        table: &RouteTable,
        etag: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
pub trait PrivateLinkServiceClient: Send + Sync {
    async fn list(&self, resource_group: &str) -> Result<Vec<PrivateLinkService>>;
    async fn create_or_update(
        &self,
        resource_group: &str,
        pls: &PrivateLinkService,
        etag: Option<&str>,
    ) -> Result<()>;
    async fn delete(&self, resource_group: &str, name: &str) -> Result<()>;
    async fn delete_private_endpoint_connection(
        &self,
        resource_group: &str,
        pls_name: &str,
        connection_name: &str,
    ) -> Result<()>;
}

/// Availability zones of a region.
#[async_trait]
pub trait ZoneClient: Send + Sync {
    async fn region_zones(&self, location: &str) -> Result<Vec<String>>;
}

/// Compute-plane view of the cluster's VM sets (availability sets or scale sets).
#[async_trait]
pub trait VmSet: Send + Sync {
    fn primary_vm_set_name(&self) -> String;

    /// Every agent-pool VM set hosting the given nodes.
    async fn vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>>;

    async fn node_vm_set_name(&self, node: &Node) -> Result<String>;

    /// Resolve a NIC IP configuration ID to `(node name, vm set name)`;
    /// `Ok(None)` when the VM no longer exists.
    async fn node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<Option<(String, String)>>;

    /// Attach the NICs of `nodes` to the backend pool.
    async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()>;

    /// Detach the listed IP configurations (or, with `delete_from_vm_set`, the VM
    /// set itself) from the backend pools. Returns whether anything changed.
    async fn ensure_backend_pool_deleted(
        &self,
        service: &Service,
        backend_pool_ids: &[String],
        vm_set_name: &str,
        pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<bool>;
}

/// Read-only snapshot queries over the cluster.
#[async_trait]
pub trait ClusterLister: Send + Sync {
    async fn list_load_balancer_services(&self) -> Result<Vec<Service>>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// Bundle of every cloud-side collaborator.
#[derive(Clone)]
pub struct CloudClients {
    pub load_balancers: Arc<dyn LoadBalancerClient>,
    pub public_ips: Arc<dyn PublicIpClient>,
    pub security_groups: Arc<dyn SecurityGroupClient>,
    pub subnets: Arc<dyn SubnetClient>,
    pub route_tables: Arc<dyn RouteTableClient>,
    pub private_link_services: Arc<dyn PrivateLinkServiceClient>,
    pub zones: Arc<dyn ZoneClient>,
    pub vm_set: Arc<dyn VmSet>,
}
