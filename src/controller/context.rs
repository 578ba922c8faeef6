//! Process-wide reconciliation context.
//!
//! Built once at startup and shared by every reconciliation. Holds the cached
//! resource store, the node caches refreshed on every pass and the multi-SLB
//! placement state, each behind its own lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::backend_pool::{is_control_plane_node, BackendPoolType};
use super::events::EventRecorder;
use super::naming;
use crate::cloud::client::{CloudClients, ClusterLister, VmSet};
use crate::cloud::store::ResourceStore;
use crate::config::CloudConfig;
use crate::error::Result;

pub const EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS_LABEL: &str =
    "node.kubernetes.io/exclude-from-external-load-balancers";

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

/// First `InternalIP` of the given family.
pub fn node_private_ip(node: &Node, ipv6: bool) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .filter(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
        .find(|ip| {
            ip.parse::<std::net::IpAddr>()
                .map(|addr| addr.is_ipv6() == ipv6)
                .unwrap_or(false)
        })
}

fn node_private_ips(node: &Node) -> BTreeSet<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .filter(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_excluded_node(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS_LABEL))
}

/// Node caches rebuilt from the full node list.
#[derive(Debug, Default)]
struct NodeCache {
    names: BTreeSet<String>,
    private_ips: HashMap<String, BTreeSet<String>>,
    ip_to_node: HashMap<String, String>,
    excluded: BTreeSet<String>,
    labels: HashMap<String, BTreeMap<String, String>>,
}

/// Live multi-SLB sets, indexed like `multiple_standard_load_balancer_configurations`.
/// Node and service names are stored lowercase.
#[derive(Debug, Default)]
pub struct PlacementState {
    pub active_nodes: Mutex<Vec<BTreeSet<String>>>,
    pub active_services: Mutex<Vec<BTreeSet<String>>>,
    pub nodes_placed_by_primary: Mutex<BTreeSet<String>>,
    pub(crate) rebuilt: AtomicBool,
}

impl PlacementState {
    pub fn new(configs: usize) -> Self {
        Self {
            active_nodes: Mutex::new(vec![BTreeSet::new(); configs]),
            active_services: Mutex::new(vec![BTreeSet::new(); configs]),
            nodes_placed_by_primary: Mutex::new(BTreeSet::new()),
            rebuilt: AtomicBool::new(false),
        }
    }

    pub fn is_rebuilt(&self) -> bool {
        self.rebuilt.load(Ordering::Acquire)
    }
}

pub struct ReconcileContext {
    pub config: Arc<CloudConfig>,
    pub store: ResourceStore,
    pub lister: Arc<dyn ClusterLister>,
    pub events: Arc<dyn EventRecorder>,
    pub placement: PlacementState,
    pub backend_pool_type: BackendPoolType,
    nodes: RwLock<NodeCache>,
    region_zones: Mutex<Option<Vec<String>>>,
}

impl ReconcileContext {
    pub fn new(
        config: Arc<CloudConfig>,
        clients: CloudClients,
        lister: Arc<dyn ClusterLister>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        let placement =
            PlacementState::new(config.multiple_standard_load_balancer_configurations.len());
        Self {
            backend_pool_type: config.backend_pool_type(),
            store: ResourceStore::new(config.clone(), clients),
            config,
            lister,
            events,
            placement,
            nodes: RwLock::new(NodeCache::default()),
            region_zones: Mutex::new(None),
        }
    }

    pub fn vm_set(&self) -> &Arc<dyn VmSet> {
        &self.store.clients.vm_set
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn primary_vm_set_name(&self) -> String {
        if !self.config.primary_vm_set_name.is_empty() {
            return self.config.primary_vm_set_name.clone();
        }
        self.vm_set().primary_vm_set_name()
    }

    /// Refresh the node caches from the full node list.
    pub fn update_node_caches(&self, nodes: &[Node]) {
        let mut cache = NodeCache::default();
        for node in nodes {
            let name = node_name(node).to_ascii_lowercase();
            let ips = node_private_ips(node);
            for ip in &ips {
                cache.ip_to_node.insert(ip.clone(), node_name(node).to_string());
            }
            if is_excluded_node(node) || is_control_plane_node(node) {
                cache.excluded.insert(name.clone());
            }
            cache.private_ips.insert(name.clone(), ips);
            cache.labels.insert(name.clone(), node_labels(node));
            cache.names.insert(name);
        }
        debug!(
            nodes = cache.names.len(),
            excluded = cache.excluded.len(),
            "node caches refreshed"
        );
        *self.nodes.write() = cache;
    }

    /// List every node through the lister and refresh the caches.
    pub async fn refresh_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.lister.list_nodes().await?;
        self.update_node_caches(&nodes);
        Ok(nodes)
    }

    pub fn is_node_excluded(&self, name: &str) -> bool {
        self.nodes.read().excluded.contains(&name.to_ascii_lowercase())
    }

    pub fn node_exists(&self, name: &str) -> bool {
        self.nodes.read().names.contains(&name.to_ascii_lowercase())
    }

    pub fn known_node_names(&self) -> BTreeSet<String> {
        self.nodes.read().names.clone()
    }

    pub fn excluded_node_private_ips(&self) -> Vec<String> {
        let cache = self.nodes.read();
        cache
            .excluded
            .iter()
            .filter_map(|n| cache.private_ips.get(n))
            .flat_map(|ips| ips.iter().cloned())
            .collect()
    }

    pub fn private_ips_of(&self, node: &str) -> BTreeSet<String> {
        self.nodes
            .read()
            .private_ips
            .get(&node.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_by_private_ip(&self, ip: &str) -> Option<String> {
        self.nodes.read().ip_to_node.get(ip).cloned()
    }

    pub fn labels_of(&self, node: &str) -> BTreeMap<String, String> {
        self.nodes
            .read()
            .labels
            .get(&node.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// VM set a load balancer serves: its name without `-internal`, or the
    /// primary VM set for the cluster's own load balancer.
    pub fn map_load_balancer_name_to_vm_set(&self, lb_name: &str) -> String {
        let vm_set = naming::trim_internal_suffix(lb_name);
        if vm_set.eq_ignore_ascii_case(self.config.load_balancer_base_name()) {
            return self.primary_vm_set_name();
        }
        vm_set.to_string()
    }

    pub fn map_vm_set_name_to_load_balancer_name(&self, vm_set: &str) -> String {
        if vm_set == self.primary_vm_set_name() {
            return self.config.load_balancer_base_name().to_string();
        }
        vm_set.to_string()
    }

    pub fn load_balancer_id(&self, lb_name: &str) -> String {
        naming::load_balancer_id(
            &self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
        )
    }

    pub fn frontend_ip_config_id(&self, lb_name: &str, name: &str) -> String {
        naming::frontend_ip_config_id(
            &self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
            name,
        )
    }

    pub fn backend_pool_name(&self, ipv6: bool) -> String {
        naming::backend_pool_name(self.cluster_name(), ipv6)
    }

    pub fn backend_pool_id(&self, lb_name: &str, ipv6: bool) -> String {
        naming::backend_pool_id(
            &self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
            &self.backend_pool_name(ipv6),
        )
    }

    pub fn probe_id(&self, lb_name: &str, name: &str) -> String {
        naming::probe_id(
            &self.config.subscription_id,
            self.config.load_balancer_resource_group(),
            lb_name,
            name,
        )
    }

    pub fn subnet_id(&self, subnet: &str) -> String {
        naming::subnet_id(
            &self.config.subscription_id,
            self.config.vnet_resource_group(),
            &self.config.vnet_name,
            subnet,
        )
    }

    pub fn vnet_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.config.subscription_id,
            self.config.vnet_resource_group(),
            self.config.vnet_name
        )
    }

    /// Availability zones of the cluster's region, fetched once.
    pub async fn region_zones(&self) -> Result<Vec<String>> {
        if let Some(zones) = self.region_zones.lock().clone() {
            return Ok(zones);
        }
        let zones = self.store.region_zones().await?;
        *self.region_zones.lock() = Some(zones.clone());
        Ok(zones)
    }

    /// Index of the multi-SLB configuration a load balancer belongs to.
    pub fn multi_slb_index(&self, lb_name: &str) -> Option<usize> {
        let base = naming::trim_internal_suffix(lb_name);
        self.config
            .multiple_standard_load_balancer_configurations
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(base))
    }

    /// Nodes currently placed on the configuration backing `lb_name`; empty
    /// when the name matches no configuration.
    pub fn active_nodes_by_load_balancer_name(&self, lb_name: &str) -> BTreeSet<String> {
        match self.multi_slb_index(lb_name) {
            Some(i) => self
                .placement
                .active_nodes
                .lock()
                .get(i)
                .cloned()
                .unwrap_or_default(),
            None => BTreeSet::new(),
        }
    }
}
