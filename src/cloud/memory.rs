//! In-process cloud backend.
//!
//! Implements every client trait over a single serializable state blob, enforces
//! ETags the way the remote API does, allocates addresses and IDs, and counts
//! writes so callers can assert idempotence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{
    CloudClients, ClusterLister, LoadBalancerClient, PrivateLinkServiceClient, PublicIpClient,
    RouteTableClient, SecurityGroupClient, SubnetClient, VmSet, ZoneClient,
};
use super::types::*;
use crate::controller::naming;
use crate::error::{Error, Result};

pub const AGENT_POOL_LABEL: &str = "kubernetes.azure.com/agentpool";

/// Everything the in-memory cloud knows, keyed by lowercase `resourceGroup/name`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudState {
    #[serde(default)]
    pub load_balancers: BTreeMap<String, LoadBalancer>,
    #[serde(default)]
    pub public_ips: BTreeMap<String, PublicIpAddress>,
    #[serde(default)]
    pub security_groups: BTreeMap<String, SecurityGroup>,
    /// Keyed by `resourceGroup/vnet/subnet`.
    #[serde(default)]
    pub subnets: BTreeMap<String, Subnet>,
    #[serde(default)]
    pub route_tables: BTreeMap<String, RouteTable>,
    #[serde(default)]
    pub private_link_services: BTreeMap<String, PrivateLinkService>,
    #[serde(default)]
    pub region_zones: BTreeMap<String, Vec<String>>,
    /// Node name to VM set name.
    #[serde(default)]
    pub node_vm_sets: BTreeMap<String, String>,
    #[serde(default)]
    pub primary_vm_set: String,
    #[serde(default)]
    next_etag: u64,
    #[serde(default)]
    next_address: u32,
}

fn key(resource_group: &str, name: &str) -> String {
    format!("{resource_group}/{name}").to_ascii_lowercase()
}

pub struct InMemoryCloud {
    subscription_id: String,
    state: Mutex<CloudState>,
    writes: Mutex<HashMap<String, usize>>,
    failures: Mutex<Vec<(String, u16)>>,
}

impl InMemoryCloud {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self::with_state(subscription_id, CloudState::default())
    }

    pub fn with_state(subscription_id: impl Into<String>, state: CloudState) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            state: Mutex::new(state),
            writes: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Load state from a JSON file, starting empty when the file does not exist.
    pub fn load(subscription_id: impl Into<String>, path: &Path) -> Result<Self> {
        let state = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            CloudState::default()
        };
        Ok(Self::with_state(subscription_id, state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(&*self.state.lock())?;
        std::fs::write(path, body)?;
        Ok(())
    }

    /// Every client trait served by one shared in-memory cloud.
    pub fn clients(self: &Arc<Self>) -> CloudClients {
        CloudClients {
            load_balancers: self.clone(),
            public_ips: self.clone(),
            security_groups: self.clone(),
            subnets: self.clone(),
            route_tables: self.clone(),
            private_link_services: self.clone(),
            zones: self.clone(),
            vm_set: self.clone(),
        }
    }

    pub fn snapshot(&self) -> CloudState {
        self.state.lock().clone()
    }

    /// Total number of mutating calls accepted so far.
    pub fn write_count(&self) -> usize {
        self.writes.lock().values().sum()
    }

    pub fn writes_of(&self, kind: &str) -> usize {
        self.writes.lock().get(kind).copied().unwrap_or(0)
    }

    /// Make the next write of `kind` fail with the given status.
    pub fn fail_next_write(&self, kind: &str, status: u16) {
        self.failures.lock().push((kind.to_string(), status));
    }

    pub fn set_primary_vm_set(&self, name: &str) {
        self.state.lock().primary_vm_set = name.to_string();
    }

    pub fn set_node_vm_set(&self, node: &str, vm_set: &str) {
        self.state
            .lock()
            .node_vm_sets
            .insert(node.to_string(), vm_set.to_string());
    }

    pub fn set_region_zones(&self, location: &str, zones: Vec<String>) {
        self.state
            .lock()
            .region_zones
            .insert(location.to_ascii_lowercase(), zones);
    }

    pub fn put_subnet(&self, resource_group: &str, vnet: &str, mut subnet: Subnet) {
        subnet.id = Some(naming::subnet_id(
            &self.subscription_id,
            resource_group,
            vnet,
            &subnet.name,
        ));
        let k = key(resource_group, &format!("{vnet}/{}", subnet.name));
        self.state.lock().subnets.insert(k, subnet);
    }

    /// Insert a public IP out-of-band, as an operator would.
    pub fn put_public_ip(&self, resource_group: &str, mut pip: PublicIpAddress) {
        let mut state = self.state.lock();
        self.stamp_public_ip(&mut state, resource_group, &mut pip);
        state.public_ips.insert(key(resource_group, &pip.name), pip);
    }

    /// Insert or replace a load balancer out-of-band.
    pub fn put_load_balancer(&self, resource_group: &str, mut lb: LoadBalancer) {
        let mut state = self.state.lock();
        self.stamp_load_balancer(&mut state, resource_group, &mut lb);
        state
            .load_balancers
            .insert(key(resource_group, &lb.name), lb);
        Self::rebind_public_ips(&mut state);
    }

    /// Delete a load balancer out-of-band.
    pub fn remove_load_balancer(&self, resource_group: &str, name: &str) {
        let mut state = self.state.lock();
        state.load_balancers.remove(&key(resource_group, name));
        Self::rebind_public_ips(&mut state);
    }

    pub fn put_private_link_service(&self, resource_group: &str, mut pls: PrivateLinkService) {
        let mut state = self.state.lock();
        pls.etag = Some(Self::next_etag(&mut state));
        state
            .private_link_services
            .insert(key(resource_group, &pls.name), pls);
    }

    pub fn load_balancer(&self, resource_group: &str, name: &str) -> Option<LoadBalancer> {
        self.state
            .lock()
            .load_balancers
            .get(&key(resource_group, name))
            .cloned()
    }

    pub fn public_ip(&self, resource_group: &str, name: &str) -> Option<PublicIpAddress> {
        self.state
            .lock()
            .public_ips
            .get(&key(resource_group, name))
            .cloned()
    }

    pub fn security_group(&self, resource_group: &str, name: &str) -> Option<SecurityGroup> {
        self.state
            .lock()
            .security_groups
            .get(&key(resource_group, name))
            .cloned()
    }

    pub fn route_table(&self, resource_group: &str, name: &str) -> Option<RouteTable> {
        self.state
            .lock()
            .route_tables
            .get(&key(resource_group, name))
            .cloned()
    }

    pub fn put_security_group(&self, resource_group: &str, mut sg: SecurityGroup) {
        let mut state = self.state.lock();
        sg.etag = Some(Self::next_etag(&mut state));
        state
            .security_groups
            .insert(key(resource_group, &sg.name), sg);
    }

    pub fn put_route_table(&self, resource_group: &str, mut table: RouteTable) {
        let mut state = self.state.lock();
        table.etag = Some(Self::next_etag(&mut state));
        state
            .route_tables
            .insert(key(resource_group, &table.name), table);
    }

    fn record_write(&self, kind: &str) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if let Some(pos) = failures.iter().position(|(k, _)| k == kind) {
                let (_, status) = failures.remove(pos);
                return Err(Error::from_status(status, kind, "", "injected failure"));
            }
        }
        *self.writes.lock().entry(kind.to_string()).or_default() += 1;
        Ok(())
    }

    fn next_etag(state: &mut CloudState) -> String {
        state.next_etag += 1;
        format!("W/\"{}\"", state.next_etag)
    }

    fn next_address(state: &mut CloudState, base: [u8; 2], ipv6: bool) -> String {
        state.next_address += 1;
        let n = state.next_address;
        let addr: IpAddr = if ipv6 {
            IpAddr::V6(Ipv6Addr::new(
                0xfd00,
                u16::from(base[0]),
                u16::from(base[1]),
                0,
                0,
                0,
                0,
                (n & 0xffff) as u16,
            ))
        } else {
            IpAddr::V4(Ipv4Addr::new(
                base[0],
                base[1],
                ((n >> 8) & 0xff) as u8,
                (n & 0xff) as u8,
            ))
        };
        addr.to_string()
    }

    fn check_etag(kind: &str, name: &str, current: Option<&String>, etag: Option<&str>) -> Result<()> {
        match (current, etag) {
            (Some(current), Some(etag)) if current != etag => Err(Error::PreconditionFailed {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn stamp_load_balancer(&self, state: &mut CloudState, resource_group: &str, lb: &mut LoadBalancer) {
        let lb_id = naming::load_balancer_id(&self.subscription_id, resource_group, &lb.name);
        lb.id = Some(lb_id.clone());
        lb.etag = Some(Self::next_etag(state));
        for fip in &mut lb.frontend_ip_configurations {
            fip.id = Some(format!("{lb_id}/frontendIPConfigurations/{}", fip.name));
            if fip.public_ip_address.is_none() && fip.private_ip_address.is_none() {
                let ipv6 = fip
                    .private_ip_address_version
                    .map(IpVersion::is_ipv6)
                    .unwrap_or(false);
                fip.private_ip_address = Some(Self::next_address(state, [10, 240], ipv6));
            }
        }
        for rule in &mut lb.load_balancing_rules {
            rule.id = Some(format!("{lb_id}/loadBalancingRules/{}", rule.name));
        }
        for probe in &mut lb.probes {
            probe.id = Some(format!("{lb_id}/probes/{}", probe.name));
        }
        for pool in &mut lb.backend_address_pools {
            pool.id = Some(format!("{lb_id}/backendAddressPools/{}", pool.name));
        }
    }

    fn stamp_public_ip(&self, state: &mut CloudState, resource_group: &str, pip: &mut PublicIpAddress) {
        pip.id = Some(naming::public_ip_id(
            &self.subscription_id,
            resource_group,
            &pip.name,
        ));
        if pip.ip_address.is_none() {
            pip.ip_address = Some(Self::next_address(state, [20, 0], pip.version().is_ipv6()));
        }
        pip.etag = Some(Self::next_etag(state));
    }

    /// Recompute which frontend each public IP is bound to.
    fn rebind_public_ips(state: &mut CloudState) {
        let mut bindings: HashMap<String, String> = HashMap::new();
        for lb in state.load_balancers.values() {
            for fip in &lb.frontend_ip_configurations {
                if let Some(pip) = &fip.public_ip_address {
                    bindings.insert(pip.id.to_ascii_lowercase(), fip.id().to_string());
                }
            }
        }
        for pip in state.public_ips.values_mut() {
            let id = pip.id.clone().unwrap_or_default().to_ascii_lowercase();
            pip.ip_configuration = bindings.get(&id).map(SubResource::new);
        }
    }
}

#[async_trait]
impl LoadBalancerClient for InMemoryCloud {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.load_balancer(resource_group, name))
    }

    async fn list(&self, resource_group: &str) -> Result<Vec<LoadBalancer>> {
        let prefix = format!("{}/", resource_group.to_ascii_lowercase());
        Ok(self
            .state
            .lock()
            .load_balancers
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, lb)| lb.clone())
            .collect())
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        lb: &LoadBalancer,
        etag: Option<&str>,
    ) -> Result<()> {
        let k = key(resource_group, &lb.name);
        {
            let state = self.state.lock();
            let current = state.load_balancers.get(&k).and_then(|l| l.etag.as_ref());
            Self::check_etag("LoadBalancer", &lb.name, current, etag)?;
        }
        self.record_write("LoadBalancer")?;
        let mut state = self.state.lock();
        let mut lb = lb.clone();
        // NIC membership is owned by the network interfaces, not the LB body.
        if let Some(current) = state.load_balancers.get(&k) {
            for pool in &mut lb.backend_address_pools {
                if let Some(existing) = current.backend_pool(&pool.name) {
                    pool.backend_ip_configurations = existing.backend_ip_configurations.clone();
                }
            }
        }
        self.stamp_load_balancer(&mut state, resource_group, &mut lb);
        debug!(name = %lb.name, "in-memory load balancer written");
        state.load_balancers.insert(k, lb);
        Self::rebind_public_ips(&mut state);
        Ok(())
    }

    async fn create_or_update_backend_pool(
        &self,
        resource_group: &str,
        lb_name: &str,
        pool: &BackendAddressPool,
    ) -> Result<()> {
        let k = key(resource_group, lb_name);
        if !self.state.lock().load_balancers.contains_key(&k) {
            return Err(Error::not_found("LoadBalancer", lb_name));
        }
        self.record_write("BackendPool")?;
        let mut state = self.state.lock();
        let etag = Self::next_etag(&mut state);
        if let Some(lb) = state.load_balancers.get_mut(&k) {
            let mut pool = pool.clone();
            pool.id = Some(format!(
                "{}/backendAddressPools/{}",
                lb.id.clone().unwrap_or_default(),
                pool.name
            ));
            match lb
                .backend_address_pools
                .iter_mut()
                .find(|p| p.name.eq_ignore_ascii_case(&pool.name))
            {
                Some(existing) => *existing = pool,
                None => lb.backend_address_pools.push(pool),
            }
            lb.etag = Some(etag);
        }
        Ok(())
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<()> {
        self.record_write("DeleteLoadBalancer")?;
        let mut state = self.state.lock();
        state.load_balancers.remove(&key(resource_group, name));
        Self::rebind_public_ips(&mut state);
        Ok(())
    }
}

#[async_trait]
impl PublicIpClient for InMemoryCloud {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<PublicIpAddress>> {
        Ok(self.public_ip(resource_group, name))
    }

    async fn list(&self, resource_group: &str) -> Result<Vec<PublicIpAddress>> {
        let prefix = format!("{}/", resource_group.to_ascii_lowercase());
        Ok(self
            .state
            .lock()
            .public_ips
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, pip)| pip.clone())
            .collect())
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        pip: &PublicIpAddress,
        etag: Option<&str>,
    ) -> Result<()> {
        let k = key(resource_group, &pip.name);
        let existing = {
            let state = self.state.lock();
            let existing = state.public_ips.get(&k).cloned();
            Self::check_etag(
                "PublicIPAddress",
                &pip.name,
                existing.as_ref().and_then(|p| p.etag.as_ref()),
                etag,
            )?;
            existing
        };
        self.record_write("PublicIPAddress")?;
        let mut state = self.state.lock();
        let mut pip = pip.clone();
        if let Some(existing) = existing {
            pip.ip_address = pip.ip_address.or(existing.ip_address);
        }
        self.stamp_public_ip(&mut state, resource_group, &mut pip);
        state.public_ips.insert(k, pip);
        Self::rebind_public_ips(&mut state);
        Ok(())
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<()> {
        let k = key(resource_group, name);
        if let Some(pip) = self.state.lock().public_ips.get(&k) {
            if let Some(config) = &pip.ip_configuration {
                return Err(Error::Cloud {
                    status: 400,
                    message: format!(
                        "public IP {name} is in use by frontend {}",
                        config.id
                    ),
                    retriable: false,
                });
            }
        }
        self.record_write("DeletePublicIPAddress")?;
        self.state.lock().public_ips.remove(&k);
        Ok(())
    }
}

#[async_trait]
impl SecurityGroupClient for InMemoryCloud {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<SecurityGroup>> {
        Ok(self.security_group(resource_group, name))
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        sg: &SecurityGroup,
        etag: Option<&str>,
    ) -> Result<()> {
        let k = key(resource_group, &sg.name);
        {
            let state = self.state.lock();
            let current = state.security_groups.get(&k).and_then(|s| s.etag.as_ref());
            Self::check_etag("SecurityGroup", &sg.name, current, etag)?;
        }
        self.record_write("SecurityGroup")?;
        let mut state = self.state.lock();
        let mut sg = sg.clone();
        sg.etag = Some(Self::next_etag(&mut state));
        state.security_groups.insert(k, sg);
        Ok(())
    }
}

#[async_trait]
impl SubnetClient for InMemoryCloud {
    async fn get(&self, resource_group: &str, vnet_name: &str, name: &str) -> Result<Option<Subnet>> {
        let k = key(resource_group, &format!("{vnet_name}/{name}"));
        Ok(self.state.lock().subnets.get(&k).cloned())
    }

    async fn create_or_update(&self, resource_group: &str, vnet_name: &str, subnet: &Subnet) -> Result<()> {
        self.record_write("Subnet")?;
        let k = key(resource_group, &format!("{vnet_name}/{}", subnet.name));
        self.state.lock().subnets.insert(k, subnet.clone());
        Ok(())
    }
}

#[async_trait]
impl RouteTableClient for InMemoryCloud {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<RouteTable>> {
        Ok(self.route_table(resource_group, name))
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        table: &RouteTable,
        etag: Option<&str>,
    ) -> Result<()> {
        let k = key(resource_group, &table.name);
        {
            let state = self.state.lock();
            let current = state.route_tables.get(&k).and_then(|t| t.etag.as_ref());
            Self::check_etag("RouteTable", &table.name, current, etag)?;
        }
        self.record_write("RouteTable")?;
        let mut state = self.state.lock();
        let mut table = table.clone();
        table.etag = Some(Self::next_etag(&mut state));
        state.route_tables.insert(k, table);
        Ok(())
    }
}

#[async_trait]
impl PrivateLinkServiceClient for InMemoryCloud {
    async fn list(&self, resource_group: &str) -> Result<Vec<PrivateLinkService>> {
        let prefix = format!("{}/", resource_group.to_ascii_lowercase());
        Ok(self
            .state
            .lock()
            .private_link_services
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, pls)| pls.clone())
            .collect())
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        pls: &PrivateLinkService,
        etag: Option<&str>,
    ) -> Result<()> {
        let k = key(resource_group, &pls.name);
        {
            let state = self.state.lock();
            let current = state.private_link_services.get(&k).and_then(|p| p.etag.as_ref());
            Self::check_etag("PrivateLinkService", &pls.name, current, etag)?;
        }
        self.record_write("PrivateLinkService")?;
        let mut state = self.state.lock();
        let mut pls = pls.clone();
        pls.id = Some(naming::private_link_service_id(
            &self.subscription_id,
            resource_group,
            &pls.name,
        ));
        pls.provisioning_state = Some("Succeeded".to_string());
        pls.etag = Some(Self::next_etag(&mut state));
        state.private_link_services.insert(k, pls);
        Ok(())
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<()> {
        self.record_write("DeletePrivateLinkService")?;
        self.state
            .lock()
            .private_link_services
            .remove(&key(resource_group, name));
        Ok(())
    }

    async fn delete_private_endpoint_connection(
        &self,
        resource_group: &str,
        pls_name: &str,
        connection_name: &str,
    ) -> Result<()> {
        self.record_write("DeletePrivateEndpointConnection")?;
        let mut state = self.state.lock();
        if let Some(pls) = state
            .private_link_services
            .get_mut(&key(resource_group, pls_name))
        {
            pls.private_endpoint_connections
                .retain(|c| !c.name.eq_ignore_ascii_case(connection_name));
        }
        Ok(())
    }
}

#[async_trait]
impl ZoneClient for InMemoryCloud {
    async fn region_zones(&self, location: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .region_zones
            .get(&location.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

/// NIC IP configuration ID the in-memory compute plane assigns to a node.
pub fn nic_ip_configuration_id(subscription_id: &str, node_name: &str) -> String {
    format!(
        "/subscriptions/{subscription_id}/resourceGroups/nodes/providers/Microsoft.Network/networkInterfaces/{node_name}-nic/ipConfigurations/ipconfig1"
    )
}

#[async_trait]
impl VmSet for InMemoryCloud {
    fn primary_vm_set_name(&self) -> String {
        self.state.lock().primary_vm_set.clone()
    }

    async fn vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for node in nodes {
            names.insert(self.node_vm_set_name(node).await?);
        }
        Ok(names.into_iter().collect())
    }

    async fn node_vm_set_name(&self, node: &Node) -> Result<String> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let state = self.state.lock();
        if let Some(set) = state.node_vm_sets.get(&name) {
            return Ok(set.clone());
        }
        Ok(node
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(AGENT_POOL_LABEL).cloned())
            .unwrap_or_else(|| state.primary_vm_set.clone()))
    }

    async fn node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<Option<(String, String)>> {
        let state = self.state.lock();
        Ok(state
            .node_vm_sets
            .iter()
            .find(|(node, _)| {
                nic_ip_configuration_id(&self.subscription_id, node)
                    .eq_ignore_ascii_case(ip_configuration_id)
            })
            .map(|(node, set)| (node.clone(), set.clone())))
    }

    async fn ensure_hosts_in_pool(
        &self,
        _service: &Service,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let mut wanted = Vec::new();
        for node in nodes {
            if self.node_vm_set_name(node).await?.eq_ignore_ascii_case(vm_set_name) {
                let name = node.metadata.name.clone().unwrap_or_default();
                self.set_node_vm_set(&name, vm_set_name);
                wanted.push(nic_ip_configuration_id(&self.subscription_id, &name));
            }
        }

        let mut state = self.state.lock();
        let mut changed = false;
        for lb in state.load_balancers.values_mut() {
            for pool in &mut lb.backend_address_pools {
                if !pool.id.as_deref().unwrap_or_default().eq_ignore_ascii_case(backend_pool_id) {
                    continue;
                }
                for id in &wanted {
                    if !pool.backend_ip_configurations.iter().any(|c| c.same_as(id)) {
                        pool.backend_ip_configurations.push(SubResource::new(id.clone()));
                        changed = true;
                    }
                }
            }
        }
        drop(state);
        if changed {
            self.record_write("NetworkInterface")?;
        }
        Ok(())
    }

    async fn ensure_backend_pool_deleted(
        &self,
        _service: &Service,
        backend_pool_ids: &[String],
        _vm_set_name: &str,
        pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<bool> {
        let remove: BTreeSet<String> = pools
            .iter()
            .flat_map(|p| p.backend_ip_configurations.iter())
            .map(|c| c.id.to_ascii_lowercase())
            .collect();
        let mut state = self.state.lock();
        let mut changed = false;
        for lb in state.load_balancers.values_mut() {
            for pool in &mut lb.backend_address_pools {
                let id = pool.id.clone().unwrap_or_default();
                if !backend_pool_ids.iter().any(|b| b.eq_ignore_ascii_case(&id)) {
                    continue;
                }
                let before = pool.backend_ip_configurations.len();
                if delete_from_vm_set {
                    pool.backend_ip_configurations.clear();
                } else {
                    pool.backend_ip_configurations
                        .retain(|c| !remove.contains(&c.id.to_ascii_lowercase()));
                }
                changed |= before != pool.backend_ip_configurations.len();
            }
        }
        drop(state);
        if changed {
            self.record_write("NetworkInterface")?;
        }
        Ok(changed)
    }
}

/// Cluster snapshot held in memory.
#[derive(Default)]
pub struct StaticClusterLister {
    services: RwLock<Vec<Service>>,
    nodes: RwLock<Vec<Node>>,
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl StaticClusterLister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_services(&self, services: Vec<Service>) {
        *self.services.write() = services;
    }

    pub fn upsert_service(&self, service: Service) {
        let mut services = self.services.write();
        services.retain(|s| {
            s.metadata.namespace != service.metadata.namespace
                || s.metadata.name != service.metadata.name
        });
        services.push(service);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.services.write().retain(|s| {
            s.metadata.namespace.as_deref() != Some(namespace)
                || s.metadata.name.as_deref() != Some(name)
        });
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.write() = nodes;
    }

    pub fn set_namespace_labels(&self, namespace: &str, labels: BTreeMap<String, String>) {
        self.namespaces.write().insert(namespace.to_string(), labels);
    }
}

#[async_trait]
impl ClusterLister for StaticClusterLister {
    async fn list_load_balancer_services(&self) -> Result<Vec<Service>> {
        Ok(self
            .services
            .read()
            .iter()
            .filter(|s| crate::controller::service::is_load_balancer_service(s))
            .cloned()
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .read()
            .iter()
            .find(|s| {
                s.metadata.namespace.as_deref() == Some(namespace)
                    && s.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.read().clone())
    }
}
