//! Backend pool membership.
//!
//! Two strategies exist, selected once from configuration: NIC IP configurations
//! attached through the compute plane, or node IP addresses written directly on
//! the pool. Both are dispatched from [`BackendPoolType`].

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info};

use super::context::{node_name, node_private_ip, ReconcileContext};
use super::naming;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{BackendAddress, BackendAddressPool, LoadBalancer, SubResource};
use crate::error::{Error, Result};

pub const CONTROL_PLANE_NODE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub const MASTER_NODE_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
pub const NODE_ROLE_LABEL: &str = "kubernetes.io/role";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendPoolType {
    /// Pool entries reference node NIC IP configurations.
    #[default]
    NodeIpConfiguration,
    /// Pool entries are node private IP addresses.
    NodeIp,
}

impl BackendPoolType {
    pub const NODE_IP_CONFIGURATION: &'static str = "nodeIPConfiguration";
    pub const NODE_IP: &'static str = "nodeIP";

    /// Parse the configuration value; empty selects the default.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(Self::NODE_IP_CONFIGURATION) {
            Ok(BackendPoolType::NodeIpConfiguration)
        } else if value.eq_ignore_ascii_case(Self::NODE_IP) {
            Ok(BackendPoolType::NodeIp)
        } else {
            Err(Error::ConfigError(format!(
                "unsupported loadBalancerBackendPoolConfigurationType {value:?}"
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendPoolType::NodeIpConfiguration => Self::NODE_IP_CONFIGURATION,
            BackendPoolType::NodeIp => Self::NODE_IP,
        }
    }
}

pub fn is_control_plane_node(node: &Node) -> bool {
    let Some(labels) = node.metadata.labels.as_ref() else {
        return false;
    };
    labels.contains_key(CONTROL_PLANE_NODE_ROLE_LABEL)
        || labels.contains_key(MASTER_NODE_ROLE_LABEL)
        || labels.get(NODE_ROLE_LABEL).map(String::as_str) == Some("master")
}

/// Result of [`ReconcileContext::reconcile_backend_pools`].
#[derive(Debug)]
pub struct BackendPoolsOutcome {
    /// The pool is managed outside the reconciler and was found.
    pub preconfigured: bool,
    /// Pools were added to the returned copy and it must be written.
    pub changed: bool,
    pub lb: LoadBalancer,
}

/// Remove the listed addresses, or all of them with `remove_all`. Unless the
/// pool may become empty, a removal that would empty it is skipped.
pub fn remove_node_ip_addresses(
    pool: &mut BackendAddressPool,
    ips: &[String],
    remove_all: bool,
    allow_empty: bool,
) -> bool {
    let remaining: Vec<BackendAddress> = pool
        .load_balancer_backend_addresses
        .iter()
        .filter(|a| match a.ip_address.as_deref() {
            None | Some("") => true,
            Some(ip) => !(remove_all || ips.iter().any(|i| i == ip)),
        })
        .cloned()
        .collect();
    let changed = remaining.len() != pool.load_balancer_backend_addresses.len();
    if remove_all {
        pool.load_balancer_backend_addresses = remaining;
        return changed;
    }
    if remaining.is_empty() && !allow_empty {
        debug!(pool = %pool.name, "pool would become empty, skipping address removal");
        return false;
    }
    if changed {
        pool.load_balancer_backend_addresses = remaining;
    }
    changed
}

/// NIC configurations to detach: those whose VM is gone, plus excluded nodes
/// unless that would empty the pool.
fn ip_configurations_to_delete(
    pool: &BackendAddressPool,
    not_found: &BTreeSet<String>,
    excluded: &BTreeSet<String>,
) -> Vec<SubResource> {
    let (mut to_delete, kept): (Vec<SubResource>, Vec<SubResource>) = pool
        .backend_ip_configurations
        .iter()
        .cloned()
        .partition(|c| not_found.contains(&c.id.to_ascii_lowercase()));
    let unwanted: Vec<SubResource> = kept
        .iter()
        .filter(|c| excluded.contains(&c.id.to_ascii_lowercase()))
        .cloned()
        .collect();
    if unwanted.len() == kept.len() {
        debug!(pool = %pool.name, "pool would become empty, keeping excluded members");
        return to_delete;
    }
    to_delete.extend(unwanted);
    to_delete
}

impl ReconcileContext {
    /// `Some(ipv6)` when `name` is one of the cluster's managed pools.
    pub fn managed_pool_family(&self, name: &str) -> Option<bool> {
        [false, true]
            .into_iter()
            .find(|ipv6| self.backend_pool_name(*ipv6).eq_ignore_ascii_case(name))
    }

    /// Add the service's nodes to one backend pool of `lb_name`.
    pub async fn ensure_hosts_in_pool(
        &self,
        svc: &Service,
        nodes: &[Node],
        pool: &BackendAddressPool,
        lb_name: &str,
    ) -> Result<()> {
        match self.backend_pool_type {
            BackendPoolType::NodeIpConfiguration => {
                self.ensure_nic_hosts_in_pool(svc, nodes, pool, lb_name)
                    .await
            }
            BackendPoolType::NodeIp => self.ensure_ip_hosts_in_pool(nodes, pool, lb_name).await,
        }
    }

    /// Make sure the cluster pools exist on `lb` and drop members that must go.
    /// Returns a possibly refreshed copy of the load balancer.
    pub async fn reconcile_backend_pools(
        &self,
        svc: &Service,
        lb: LoadBalancer,
    ) -> Result<BackendPoolsOutcome> {
        match self.backend_pool_type {
            BackendPoolType::NodeIpConfiguration => self.reconcile_nic_backend_pools(svc, lb).await,
            BackendPoolType::NodeIp => self.reconcile_ip_backend_pools(svc, lb).await,
        }
    }

    /// Private IPs of every backend in the cluster pools, split `(v4, v6)`.
    pub async fn backend_private_ips(&self, lb: &LoadBalancer) -> (Vec<String>, Vec<String>) {
        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();
        let mut push = |ip: String| {
            if ip.contains(':') {
                v6.insert(ip);
            } else {
                v4.insert(ip);
            }
        };
        for pool in &lb.backend_address_pools {
            if self.managed_pool_family(&pool.name).is_none() {
                continue;
            }
            match self.backend_pool_type {
                BackendPoolType::NodeIpConfiguration => {
                    for config in &pool.backend_ip_configurations {
                        match self.vm_set().node_name_by_ip_configuration_id(&config.id).await {
                            Ok(Some((node, _))) => {
                                self.private_ips_of(&node).into_iter().for_each(&mut push)
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!(id = %config.id, error = %e, "cannot resolve backend node")
                            }
                        }
                    }
                }
                BackendPoolType::NodeIp => pool
                    .load_balancer_backend_addresses
                    .iter()
                    .filter_map(|a| a.ip_address.clone())
                    .for_each(&mut push),
            }
        }
        (v4.into_iter().collect(), v6.into_iter().collect())
    }

    /// Detach the given pools of a load balancer from every VM set, before the
    /// load balancer itself is deleted.
    pub async fn decouple_backend_pools(
        &self,
        svc: &Service,
        lb: &LoadBalancer,
        vm_set_name: &str,
    ) -> Result<bool> {
        let ids: Vec<String> = [false, true]
            .into_iter()
            .map(|ipv6| self.backend_pool_id(&lb.name, ipv6))
            .collect();
        self.vm_set()
            .ensure_backend_pool_deleted(svc, &ids, vm_set_name, &lb.backend_address_pools, true)
            .await
    }

    fn candidate_nodes<'a>(&self, nodes: &'a [Node], lb_name: &str) -> Vec<&'a Node> {
        let active = self
            .config
            .use_multiple_standard_load_balancers()
            .then(|| self.active_nodes_by_load_balancer_name(lb_name));
        nodes
            .iter()
            .filter(|n| !is_control_plane_node(n) && !self.is_node_excluded(node_name(n)))
            .filter(|n| match &active {
                Some(active) => active.contains(&node_name(n).to_ascii_lowercase()),
                None => true,
            })
            .collect()
    }

    async fn ensure_nic_hosts_in_pool(
        &self,
        svc: &Service,
        nodes: &[Node],
        pool: &BackendAddressPool,
        lb_name: &str,
    ) -> Result<()> {
        let Some(ipv6) = self.managed_pool_family(&pool.name) else {
            return Ok(());
        };
        let members: Vec<Node> = self
            .candidate_nodes(nodes, lb_name)
            .into_iter()
            .cloned()
            .collect();
        let pool_id = self.backend_pool_id(lb_name, ipv6);
        let vm_set_name = self.map_load_balancer_name_to_vm_set(lb_name);
        if self.config.use_standard_load_balancer() {
            // A standard load balancer spans every VM set.
            for set in self.vm_set().vm_set_names(&members).await? {
                self.vm_set()
                    .ensure_hosts_in_pool(svc, &members, &pool_id, &set)
                    .await?;
            }
            return Ok(());
        }
        self.vm_set()
            .ensure_hosts_in_pool(svc, &members, &pool_id, &vm_set_name)
            .await
    }

    async fn ensure_ip_hosts_in_pool(
        &self,
        nodes: &[Node],
        pool: &BackendAddressPool,
        lb_name: &str,
    ) -> Result<()> {
        let ipv6 = naming::is_backend_pool_ipv6(&pool.name);
        if !self.backend_pool_name(ipv6).eq_ignore_ascii_case(&pool.name) {
            return Ok(());
        }
        let multi_slb = self.config.use_multiple_standard_load_balancers();
        let active = self.active_nodes_by_load_balancer_name(lb_name);

        let mut pool = pool.clone();
        let vnet = SubResource::new(self.vnet_id());
        let mut changed = pool.virtual_network.as_ref() != Some(&vnet);
        pool.virtual_network = Some(vnet);

        let mut node_ips = BTreeSet::new();
        let mut added = 0usize;
        for node in nodes {
            if is_control_plane_node(node) {
                continue;
            }
            let Some(ip) = node_private_ip(node, ipv6) else {
                continue;
            };
            node_ips.insert(ip.clone());
            if multi_slb && !active.contains(&node_name(node).to_ascii_lowercase()) {
                continue;
            }
            if !pool.has_ip_address(&ip) {
                pool.load_balancer_backend_addresses.push(BackendAddress {
                    name: node_name(node).to_string(),
                    ip_address: Some(ip),
                    virtual_network: None,
                });
                added += 1;
            }
        }

        let to_delete: Vec<String> = pool
            .load_balancer_backend_addresses
            .iter()
            .filter_map(|a| a.ip_address.clone())
            .filter(|ip| {
                if !node_ips.contains(ip) {
                    return true;
                }
                multi_slb
                    && self
                        .node_by_private_ip(ip)
                        .is_some_and(|n| !active.contains(&n.to_ascii_lowercase()))
            })
            .collect();
        let removed = remove_node_ip_addresses(&mut pool, &to_delete, false, multi_slb);

        changed |= added > 0 || removed;
        if changed {
            info!(
                pool = %pool.name,
                lb = lb_name,
                added,
                removed = to_delete.len(),
                "updating backend pool"
            );
            self.store.create_or_update_backend_pool(lb_name, &pool).await?;
        }
        Ok(())
    }

    async fn reconcile_nic_backend_pools(
        &self,
        svc: &Service,
        mut lb: LoadBalancer,
    ) -> Result<BackendPoolsOutcome> {
        let mut preconfigured = service::is_backend_pool_preconfigured(svc, &self.config);
        let vm_set_name = self.map_load_balancer_name_to_vm_set(&lb.name);
        let mut found = [false, false];
        let mut updated = false;
        let mut pool_ids = Vec::new();
        let mut pools_to_delete = Vec::new();

        for i in (0..lb.backend_address_pools.len()).rev() {
            let Some(ipv6) = self.managed_pool_family(&lb.backend_address_pools[i].name) else {
                continue;
            };
            found[usize::from(ipv6)] = true;
            if preconfigured {
                break;
            }

            // Switching from IP based membership: clear the addresses first.
            let pool = &mut lb.backend_address_pools[i];
            if !pool.load_balancer_backend_addresses.is_empty()
                && remove_node_ip_addresses(pool, &[], true, false)
            {
                pool.virtual_network = None;
                self.store
                    .create_or_update_backend_pool(&lb.name, pool)
                    .await?;
                updated = true;
            }

            let mut not_found = BTreeSet::new();
            let mut excluded = BTreeSet::new();
            for config in &lb.backend_address_pools[i].backend_ip_configurations {
                match self
                    .vm_set()
                    .node_name_by_ip_configuration_id(&config.id)
                    .await?
                {
                    None => {
                        debug!(id = %config.id, "VM not found for backend IP configuration");
                        not_found.insert(config.id.to_ascii_lowercase());
                    }
                    Some((node, _)) if self.is_node_excluded(&node) => {
                        excluded.insert(config.id.to_ascii_lowercase());
                    }
                    Some(_) => {}
                }
            }
            let configs =
                ip_configurations_to_delete(&lb.backend_address_pools[i], &not_found, &excluded);
            if !configs.is_empty() {
                let id = self.backend_pool_id(&lb.name, ipv6);
                pools_to_delete.push(BackendAddressPool {
                    name: self.backend_pool_name(ipv6),
                    id: Some(id.clone()),
                    backend_ip_configurations: configs,
                    ..Default::default()
                });
                pool_ids.push(id);
            }
        }

        if !pools_to_delete.is_empty()
            && self
                .vm_set()
                .ensure_backend_pool_deleted(svc, &pool_ids, &vm_set_name, &pools_to_delete, false)
                .await?
        {
            updated = true;
        }

        if updated {
            debug!(lb = %lb.name, "refreshing load balancer after backend pool cleanup");
            if let Some(fresh) = self
                .store
                .get_load_balancer(&lb.name, CacheReadType::ForceRefresh)
                .await?
            {
                lb = fresh;
            }
        }

        let changed = self.add_missing_pools(svc, &mut lb, found, &mut preconfigured);
        Ok(BackendPoolsOutcome {
            preconfigured,
            changed,
            lb,
        })
    }

    async fn reconcile_ip_backend_pools(
        &self,
        svc: &Service,
        mut lb: LoadBalancer,
    ) -> Result<BackendPoolsOutcome> {
        let mut preconfigured = service::is_backend_pool_preconfigured(svc, &self.config);
        let vm_set_name = self.map_load_balancer_name_to_vm_set(&lb.name);
        let mut found = [false, false];
        let mut indexes = Vec::new();
        let mut pool_ids = Vec::new();
        let mut migration = false;

        for (i, pool) in lb.backend_address_pools.iter().enumerate() {
            let Some(ipv6) = self.managed_pool_family(&pool.name) else {
                continue;
            };
            indexes.push(i);
            found[usize::from(ipv6)] = true;
            pool_ids.push(self.backend_pool_id(&lb.name, ipv6));
            if !pool.backend_ip_configurations.is_empty() {
                info!(
                    pool = %pool.name,
                    nics = pool.backend_ip_configurations.len(),
                    "migrating NIC based backend pool to IP based"
                );
                migration = true;
            }
        }

        let mut refresh = false;
        if !preconfigured {
            refresh = self
                .vm_set()
                .ensure_backend_pool_deleted(
                    svc,
                    &pool_ids,
                    &vm_set_name,
                    &lb.backend_address_pools,
                    true,
                )
                .await?;

            let excluded_ips = self.excluded_node_private_ips();
            for i in indexes {
                let pool = &mut lb.backend_address_pools[i];
                let mut updated = !excluded_ips.is_empty()
                    && remove_node_ip_addresses(pool, &excluded_ips, false, false);

                // The virtual network belongs on the pool, not on each address.
                if pool.virtual_network.is_none() {
                    let vnet = pool
                        .load_balancer_backend_addresses
                        .iter_mut()
                        .filter_map(|a| a.virtual_network.take())
                        .next();
                    if let Some(vnet) = vnet {
                        pool.virtual_network = Some(vnet);
                        updated = true;
                    }
                }

                if updated {
                    self.store
                        .create_or_update_backend_pool(&lb.name, pool)
                        .await?;
                    refresh = true;
                }
            }
        }

        if refresh || migration {
            debug!(lb = %lb.name, "refreshing load balancer after backend pool cleanup");
            if let Some(fresh) = self
                .store
                .get_load_balancer(&lb.name, CacheReadType::ForceRefresh)
                .await?
            {
                lb = fresh;
            }
        }

        let changed = self.add_missing_pools(svc, &mut lb, found, &mut preconfigured);
        Ok(BackendPoolsOutcome {
            preconfigured,
            changed,
            lb,
        })
    }

    fn add_missing_pools(
        &self,
        svc: &Service,
        lb: &mut LoadBalancer,
        found: [bool; 2],
        preconfigured: &mut bool,
    ) -> bool {
        let mut changed = false;
        for ipv6 in service::ipv6_flags(svc) {
            if found[usize::from(ipv6)] {
                continue;
            }
            let name = self.backend_pool_name(ipv6);
            if *preconfigured {
                info!(
                    pool = %name,
                    "pre-configured backend pool not found, creating it"
                );
                *preconfigured = false;
            }
            lb.backend_address_pools.push(BackendAddressPool::new(name));
            changed = true;
        }
        changed
    }
}
