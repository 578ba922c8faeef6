//! Multi standard load balancer placement of nodes and services.
//!
//! Live sets are rebuilt from the observed load balancers once per process,
//! then kept current by every reconciliation. Node and service names are
//! stored lowercase.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, warn};

use super::backend_pool::BackendPoolType;
use super::context::{node_labels, node_name, ReconcileContext};
use super::naming;
use super::selector;
use super::service;
use crate::cloud::types::LoadBalancer;
use crate::error::{Error, Result};

pub const FAILED_TO_FIND_LOAD_BALANCER_FOR_NODE: &str = "FailedToFindLoadBalancerForNode";

/// Whether a configuration's load balancer exists or is the one being reconciled.
fn is_materialized(lbs: &[LoadBalancer], config_name: &str, lb_name: &str) -> bool {
    naming::trim_internal_suffix(lb_name).eq_ignore_ascii_case(config_name)
        || lbs
            .iter()
            .any(|lb| naming::trim_internal_suffix(&lb.name).eq_ignore_ascii_case(config_name))
}

impl ReconcileContext {
    /// Record whether the service is active on the configuration behind `lb_name`.
    pub fn update_service_placement_status(&self, want_lb: bool, svc_name: &str, lb_name: &str) {
        let Some(index) = self.multi_slb_index(lb_name) else {
            return;
        };
        let name = svc_name.to_ascii_lowercase();
        let mut active = self.placement.active_services.lock();
        let Some(services) = active.get_mut(index) else {
            return;
        };
        if want_lb {
            if services.insert(name) {
                debug!(service = svc_name, lb = lb_name, "service is active on load balancer");
            }
        } else if services.remove(&name) {
            debug!(service = svc_name, lb = lb_name, "service is no longer active on load balancer");
        }
    }

    /// Rebuild the live sets from the observed load balancers. Runs once per
    /// process; later calls return immediately.
    pub async fn rebuild_placement(
        &self,
        svc: &Service,
        lbs: &[LoadBalancer],
        nodes: &[Node],
    ) -> Result<()> {
        if !self.config.use_multiple_standard_load_balancers() || self.placement.is_rebuilt() {
            return Ok(());
        }
        let cluster = self.cluster_name();
        if self
            .config
            .multiple_standard_load_balancer_configurations
            .iter()
            .all(|c| !c.name.eq_ignore_ascii_case(cluster))
        {
            return Err(Error::ConfigError(format!(
                "multiple standard load balancers are enabled but no configuration is named {cluster:?}"
            )));
        }

        let mut prefixes: BTreeMap<String, String> = BTreeMap::new();
        for other in self.lister.list_load_balancer_services().await? {
            if service::is_load_balancer_service(&other) {
                prefixes.insert(
                    naming::rule_prefix(&other).to_ascii_lowercase(),
                    service::service_name(&other).to_ascii_lowercase(),
                );
            }
        }
        for lb in lbs {
            let Some(index) = self.multi_slb_index(&lb.name) else {
                continue;
            };
            for rule in &lb.load_balancing_rules {
                let prefix = rule.name.split('-').next().unwrap_or_default();
                if prefix.is_empty() {
                    warn!(rule = %rule.name, "load balancing rule name has no prefix");
                    continue;
                }
                if let Some(svc_name) = prefixes.get(&prefix.to_ascii_lowercase()) {
                    info!(lb = %lb.name, service = %svc_name, "restoring active service");
                    if let Some(set) = self.placement.active_services.lock().get_mut(index) {
                        set.insert(svc_name.clone());
                    }
                }
            }
        }

        self.record_existing_nodes(lbs).await?;
        self.place_nodes(svc, "", lbs, nodes).await?;
        self.placement.rebuilt.store(true, Ordering::Release);
        Ok(())
    }

    async fn record_existing_nodes(&self, lbs: &[LoadBalancer]) -> Result<()> {
        for lb in lbs {
            let Some(index) = self.multi_slb_index(&lb.name) else {
                continue;
            };
            let mut members = BTreeSet::new();
            for pool in &lb.backend_address_pools {
                if self.managed_pool_family(&pool.name).is_none() {
                    continue;
                }
                match self.backend_pool_type {
                    BackendPoolType::NodeIp => {
                        for address in &pool.load_balancer_backend_addresses {
                            if let Some(node) = address
                                .ip_address
                                .as_deref()
                                .and_then(|ip| self.node_by_private_ip(ip))
                            {
                                members.insert(node.to_ascii_lowercase());
                            }
                        }
                    }
                    BackendPoolType::NodeIpConfiguration => {
                        for config in &pool.backend_ip_configurations {
                            if let Some((node, _)) =
                                self.vm_set().node_name_by_ip_configuration_id(&config.id).await?
                            {
                                members.insert(node.to_ascii_lowercase());
                            }
                        }
                    }
                }
            }
            if let Some(set) = self.placement.active_nodes.lock().get_mut(index) {
                set.extend(members);
            }
        }
        Ok(())
    }

    /// Drop nodes that left the cluster. Returns the configuration index of
    /// every remaining placed node.
    fn prune_deleted_nodes(&self, nodes: &[Node]) -> BTreeMap<String, usize> {
        let present: BTreeSet<String> = nodes
            .iter()
            .map(|n| node_name(n).to_ascii_lowercase())
            .collect();
        let mut placed = BTreeMap::new();
        let mut active = self.placement.active_nodes.lock();
        for (i, set) in active.iter_mut().enumerate() {
            set.retain(|node| {
                let keep = present.contains(node);
                if keep {
                    placed.insert(node.clone(), i);
                } else {
                    debug!(node = %node, "node is gone, removing it from placement");
                }
                keep
            });
        }
        placed
    }

    fn move_node(&self, placed: &mut BTreeMap<String, usize>, node: &str, to: usize) {
        let mut active = self.placement.active_nodes.lock();
        if let Some(from) = placed.remove(node) {
            if let Some(set) = active.get_mut(from) {
                set.remove(node);
            }
        }
        if let Some(set) = active.get_mut(to) {
            set.insert(node.to_string());
        }
        placed.insert(node.to_string(), to);
    }

    /// Assign every node to one configuration: first by primary VM set, then
    /// by node selector and fewest active nodes. `lb_name` counts as existing.
    pub async fn place_nodes(
        &self,
        svc: &Service,
        lb_name: &str,
        lbs: &[LoadBalancer],
        nodes: &[Node],
    ) -> Result<()> {
        if !self.config.use_multiple_standard_load_balancers() {
            return Ok(());
        }
        let configs = &self.config.multiple_standard_load_balancer_configurations;
        let mut placed = self.prune_deleted_nodes(nodes);

        for node in nodes {
            let name = node_name(node).to_ascii_lowercase();
            if self.placement.nodes_placed_by_primary.lock().contains(&name) {
                continue;
            }
            let vm_set = self.vm_set().node_vm_set_name(node).await?;
            let Some(index) = configs
                .iter()
                .position(|c| !c.primary_vm_set.is_empty() && c.primary_vm_set.eq_ignore_ascii_case(&vm_set))
            else {
                continue;
            };
            if !is_materialized(lbs, &configs[index].name, lb_name) {
                debug!(node = %name, lb = %configs[index].name, "primary load balancer not created yet");
                continue;
            }
            self.placement.nodes_placed_by_primary.lock().insert(name.clone());
            if placed.get(&name) != Some(&index) {
                debug!(node = %name, lb = %configs[index].name, "placing node by primary VM set");
                self.move_node(&mut placed, &name, index);
            }
        }

        for node in nodes {
            let name = node_name(node).to_ascii_lowercase();
            if self.placement.nodes_placed_by_primary.lock().contains(&name) {
                continue;
            }
            let labels = node_labels(node);
            let mut eligible = Vec::new();
            for (i, config) in configs.iter().enumerate() {
                let Some(sel) = &config.node_selector else {
                    continue;
                };
                let declares = sel.match_labels.as_ref().is_some_and(|m| !m.is_empty())
                    || sel.match_expressions.as_ref().is_some_and(|m| !m.is_empty());
                if declares && selector::matches(sel, &labels)? {
                    eligible.push(i);
                }
            }
            if eligible.is_empty() {
                eligible = (0..configs.len())
                    .filter(|&i| configs[i].node_selector.is_none())
                    .collect();
            }
            eligible.retain(|&i| is_materialized(lbs, &configs[i].name, lb_name));

            if let Some(current) = placed.get(&name) {
                if eligible.contains(current) {
                    continue;
                }
            }

            let target = {
                let active = self.placement.active_nodes.lock();
                eligible
                    .iter()
                    .copied()
                    .min_by_key(|&i| active.get(i).map_or(0, BTreeSet::len))
            };
            let Some(target) = target else {
                if let Some(from) = placed.remove(&name) {
                    if let Some(set) = self.placement.active_nodes.lock().get_mut(from) {
                        set.remove(&name);
                    }
                }
                let message = format!("failed to find a load balancer for node {}", node_name(node));
                self.events
                    .warn(svc, FAILED_TO_FIND_LOAD_BALANCER_FOR_NODE, &message)
                    .await;
                continue;
            };
            debug!(node = %name, lb = %configs[target].name, "placing node on the eligible load balancer with fewest nodes");
            self.move_node(&mut placed, &name, target);
        }

        #[cfg(feature = "metrics")]
        {
            let active = self.placement.active_nodes.lock();
            for (config, set) in configs.iter().zip(active.iter()) {
                super::metrics::set_multi_slb_active_nodes(&config.name, set.len());
            }
        }
        Ok(())
    }
}
