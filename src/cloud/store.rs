//! Cached, metered access to the cloud clients.
//!
//! Writes carry the ETag of the copy they were derived from and always drop the
//! cached entry afterwards; a stale-copy failure drops it too so the next pass
//! reads fresh state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::cache::{CacheReadType, ResourceCache};
use super::client::CloudClients;
use super::types::{
    BackendAddressPool, LoadBalancer, PrivateLinkService, PublicIpAddress, RouteTable,
    SecurityGroup, Subnet,
};
use crate::config::CloudConfig;
use crate::error::Result;

#[cfg(feature = "metrics")]
use crate::controller::metrics;

pub struct ResourceStore {
    pub config: Arc<CloudConfig>,
    pub clients: CloudClients,
    lb_cache: ResourceCache<LoadBalancer>,
    /// Public IPs are cached per resource group as a full listing.
    pip_cache: ResourceCache<Vec<PublicIpAddress>>,
    nsg_cache: ResourceCache<SecurityGroup>,
    route_table_cache: ResourceCache<RouteTable>,
    /// Private link services are cached per resource group as a full listing.
    pls_cache: ResourceCache<Vec<PrivateLinkService>>,
}

fn record_write(resource: &str, operation: &str) {
    #[cfg(feature = "metrics")]
    metrics::inc_cloud_write(resource, operation);
    let _ = (resource, operation);
}

impl ResourceStore {
    pub fn new(config: Arc<CloudConfig>, clients: CloudClients) -> Self {
        let ttls = &config.cache_ttl_seconds;
        Self {
            lb_cache: ResourceCache::new("LoadBalancer", Duration::from_secs(ttls.load_balancer)),
            pip_cache: ResourceCache::new("PublicIPAddress", Duration::from_secs(ttls.public_ip)),
            nsg_cache: ResourceCache::new("SecurityGroup", Duration::from_secs(ttls.security_group)),
            route_table_cache: ResourceCache::new(
                "RouteTable",
                Duration::from_secs(ttls.route_table),
            ),
            pls_cache: ResourceCache::new(
                "PrivateLinkService",
                Duration::from_secs(ttls.private_link_service),
            ),
            config,
            clients,
        }
    }

    // Load balancers

    pub async fn get_load_balancer(
        &self,
        name: &str,
        read: CacheReadType,
    ) -> Result<Option<LoadBalancer>> {
        let rg = self.config.load_balancer_resource_group().to_string();
        let client = self.clients.load_balancers.clone();
        let lb_name = name.to_string();
        self.lb_cache
            .get(name, read, || async move { client.get(&rg, &lb_name).await })
            .await
    }

    /// List every load balancer in the resource group, refreshing the per-LB cache.
    pub async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        let lbs = self
            .clients
            .load_balancers
            .list(self.config.load_balancer_resource_group())
            .await?;
        for lb in &lbs {
            self.lb_cache.set(&lb.name, Some(lb.clone()));
        }
        Ok(lbs)
    }

    pub async fn create_or_update_load_balancer(&self, lb: &LoadBalancer) -> Result<()> {
        let rg = self.config.load_balancer_resource_group();
        debug!(lb = %lb.name, "writing load balancer");
        let result = self
            .clients
            .load_balancers
            .create_or_update(rg, lb, lb.etag.as_deref())
            .await;
        self.lb_cache.invalidate(&lb.name);
        if let Err(e) = &result {
            warn!(lb = %lb.name, error = %e, "load balancer write failed");
        } else {
            record_write("load_balancer", "create_or_update");
        }
        result
    }

    pub async fn create_or_update_backend_pool(
        &self,
        lb_name: &str,
        pool: &BackendAddressPool,
    ) -> Result<()> {
        let rg = self.config.load_balancer_resource_group();
        let result = self
            .clients
            .load_balancers
            .create_or_update_backend_pool(rg, lb_name, pool)
            .await;
        self.lb_cache.invalidate(lb_name);
        if result.is_ok() {
            record_write("backend_pool", "create_or_update");
        }
        result
    }

    pub async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        let rg = self.config.load_balancer_resource_group();
        let result = self.clients.load_balancers.delete(rg, name).await;
        self.lb_cache.invalidate(name);
        if result.is_ok() {
            record_write("load_balancer", "delete");
        }
        result
    }

    pub fn invalidate_load_balancer(&self, name: &str) {
        self.lb_cache.invalidate(name);
    }

    // Public IPs

    pub async fn list_public_ips(
        &self,
        resource_group: &str,
        read: CacheReadType,
    ) -> Result<Vec<PublicIpAddress>> {
        let client = self.clients.public_ips.clone();
        let rg = resource_group.to_string();
        Ok(self
            .pip_cache
            .get(resource_group, read, || async move {
                client.list(&rg).await.map(Some)
            })
            .await?
            .unwrap_or_default())
    }

    pub async fn get_public_ip(
        &self,
        resource_group: &str,
        name: &str,
        read: CacheReadType,
    ) -> Result<Option<PublicIpAddress>> {
        let pips = self.list_public_ips(resource_group, read).await?;
        Ok(pips.into_iter().find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    pub async fn find_public_ip_by_address(
        &self,
        resource_group: &str,
        address: &str,
    ) -> Result<Option<PublicIpAddress>> {
        let pips = self.list_public_ips(resource_group, CacheReadType::Default).await?;
        if let Some(pip) = pips
            .iter()
            .find(|p| p.ip_address.as_deref() == Some(address))
        {
            return Ok(Some(pip.clone()));
        }
        // A freshly allocated address may not be in the cached listing yet.
        let pips = self
            .list_public_ips(resource_group, CacheReadType::ForceRefresh)
            .await?;
        Ok(pips
            .into_iter()
            .find(|p| p.ip_address.as_deref() == Some(address)))
    }

    pub async fn create_or_update_public_ip(
        &self,
        resource_group: &str,
        pip: &PublicIpAddress,
    ) -> Result<()> {
        debug!(pip = %pip.name, "writing public IP");
        let result = self
            .clients
            .public_ips
            .create_or_update(resource_group, pip, pip.etag.as_deref())
            .await;
        self.pip_cache.invalidate(resource_group);
        if result.is_ok() {
            record_write("public_ip", "create_or_update");
        }
        result
    }

    pub async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<()> {
        let result = self.clients.public_ips.delete(resource_group, name).await;
        self.pip_cache.invalidate(resource_group);
        if result.is_ok() {
            record_write("public_ip", "delete");
        }
        result
    }

    // Security group

    pub async fn get_security_group(&self, read: CacheReadType) -> Result<Option<SecurityGroup>> {
        let rg = self.config.security_group_resource_group().to_string();
        let name = self.config.security_group_name.clone();
        let client = self.clients.security_groups.clone();
        self.nsg_cache
            .get(&self.config.security_group_name, read, || async move {
                client.get(&rg, &name).await
            })
            .await
    }

    pub async fn create_or_update_security_group(&self, sg: &SecurityGroup) -> Result<()> {
        let rg = self.config.security_group_resource_group();
        let result = self
            .clients
            .security_groups
            .create_or_update(rg, sg, sg.etag.as_deref())
            .await;
        self.nsg_cache.invalidate(&sg.name);
        if result.is_ok() {
            record_write("security_group", "create_or_update");
        }
        result
    }

    // Subnets

    pub async fn get_subnet(&self, vnet_name: &str, name: &str) -> Result<Option<Subnet>> {
        self.clients
            .subnets
            .get(self.config.vnet_resource_group(), vnet_name, name)
            .await
    }

    pub async fn create_or_update_subnet(&self, vnet_name: &str, subnet: &Subnet) -> Result<()> {
        let result = self
            .clients
            .subnets
            .create_or_update(self.config.vnet_resource_group(), vnet_name, subnet)
            .await;
        if result.is_ok() {
            record_write("subnet", "create_or_update");
        }
        result
    }

    // Route table

    pub async fn get_route_table(&self, read: CacheReadType) -> Result<Option<RouteTable>> {
        let rg = self.config.route_table_resource_group().to_string();
        let name = self.config.route_table_name.clone();
        let client = self.clients.route_tables.clone();
        self.route_table_cache
            .get(&self.config.route_table_name, read, || async move {
                client.get(&rg, &name).await
            })
            .await
    }

    pub async fn create_or_update_route_table(&self, table: &RouteTable) -> Result<()> {
        let rg = self.config.route_table_resource_group();
        let result = self
            .clients
            .route_tables
            .create_or_update(rg, table, table.etag.as_deref())
            .await;
        self.route_table_cache.invalidate(&table.name);
        if result.is_ok() {
            record_write("route_table", "create_or_update");
        }
        result
    }

    // Private link services

    pub async fn get_private_link_service_by_frontend(
        &self,
        resource_group: &str,
        frontend_id: &str,
        read: CacheReadType,
    ) -> Result<Option<PrivateLinkService>> {
        let client = self.clients.private_link_services.clone();
        let rg = resource_group.to_string();
        let all = self
            .pls_cache
            .get(resource_group, read, || async move {
                client.list(&rg).await.map(Some)
            })
            .await?
            .unwrap_or_default();
        Ok(all.into_iter().find(|pls| {
            pls.load_balancer_frontend_ip_configurations
                .iter()
                .any(|f| f.same_as(frontend_id))
        }))
    }

    pub async fn create_or_update_private_link_service(
        &self,
        resource_group: &str,
        pls: &PrivateLinkService,
    ) -> Result<()> {
        let result = self
            .clients
            .private_link_services
            .create_or_update(resource_group, pls, pls.etag.as_deref())
            .await;
        self.pls_cache.invalidate(resource_group);
        if result.is_ok() {
            record_write("private_link_service", "create_or_update");
        }
        result
    }

    pub async fn delete_private_link_service(
        &self,
        resource_group: &str,
        pls: &PrivateLinkService,
    ) -> Result<()> {
        for connection in &pls.private_endpoint_connections {
            self.clients
                .private_link_services
                .delete_private_endpoint_connection(resource_group, &pls.name, &connection.name)
                .await?;
        }
        let result = self
            .clients
            .private_link_services
            .delete(resource_group, &pls.name)
            .await;
        self.pls_cache.invalidate(resource_group);
        if result.is_ok() {
            record_write("private_link_service", "delete");
        }
        result
    }

    pub async fn region_zones(&self) -> Result<Vec<String>> {
        self.clients.zones.region_zones(&self.config.location).await
    }
}
