//! Load balancer composition: pools, frontends, rules, probes and tags of one
//! load balancer converged for a service in a single read-modify-write.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, instrument, warn};

use super::context::ReconcileContext;
use super::naming;
use super::rule_diff;
use super::rules::{self, RuleTarget};
use super::selection::ServiceLoadBalancer;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{FrontendIpConfiguration, LoadBalancer};
use crate::config;
use crate::error::{Error, Result};

/// Replace the copy of `lb` in `lbs`, or append it.
fn upsert(lbs: &mut Vec<LoadBalancer>, lb: &LoadBalancer) {
    match lbs.iter_mut().find(|l| l.name.eq_ignore_ascii_case(&lb.name)) {
        Some(slot) => *slot = lb.clone(),
        None => lbs.push(lb.clone()),
    }
}

/// Drop the named frontends from `lb` along with every rule and probe whose
/// name carries one of them. Returns whether anything was removed.
pub fn strip_frontends(lb: &mut LoadBalancer, names: &BTreeSet<String>) -> bool {
    let before = (
        lb.frontend_ip_configurations.len(),
        lb.load_balancing_rules.len(),
        lb.probes.len(),
    );
    let mentions = |name: &str| names.iter().any(|fip| name.contains(fip.as_str()));
    lb.frontend_ip_configurations
        .retain(|fip| !names.contains(&fip.name));
    lb.load_balancing_rules.retain(|r| !mentions(&r.name));
    lb.probes.retain(|p| !mentions(&p.name));
    before
        != (
            lb.frontend_ip_configurations.len(),
            lb.load_balancing_rules.len(),
            lb.probes.len(),
        )
}

impl ReconcileContext {
    /// Load balancers this cluster manages: the cluster's own pair, the
    /// multi-SLB configurations and, on Basic, one per agent pool VM set.
    pub async fn list_managed_load_balancers(
        &self,
        nodes: Option<&[Node]>,
    ) -> Result<Vec<LoadBalancer>> {
        let all = self.store.list_load_balancers().await?;
        let mut managed: BTreeSet<String> =
            BTreeSet::from([self.config.load_balancer_base_name().to_ascii_lowercase()]);

        if !self.config.use_standard_load_balancer() {
            let Some(nodes) = nodes else {
                return Ok(all);
            };
            for vm_set in self.vm_set().vm_set_names(nodes).await? {
                managed.insert(self.map_vm_set_name_to_load_balancer_name(&vm_set).to_ascii_lowercase());
            }
        }
        for slb in &self.config.multiple_standard_load_balancer_configurations {
            managed.insert(slb.name.to_ascii_lowercase());
        }

        Ok(all
            .into_iter()
            .filter(|lb| managed.contains(&naming::trim_internal_suffix(&lb.name).to_ascii_lowercase()))
            .collect())
    }

    /// Take the service's frontends off a load balancer it is leaving. The
    /// load balancer is deleted when no frontend remains; returns whether
    /// that happened.
    pub async fn remove_frontends_from_load_balancer(
        &self,
        svc: &Service,
        lb: &mut LoadBalancer,
        frontends: &[FrontendIpConfiguration],
        existing: &[LoadBalancer],
    ) -> Result<bool> {
        let names: BTreeSet<String> = frontends.iter().map(|f| f.name.clone()).collect();
        if !strip_frontends(lb, &names) {
            return Ok(false);
        }
        for fip in frontends {
            self.reconcile_private_link_service(svc, fip, false).await?;
        }

        if lb.frontend_ip_configurations.is_empty() {
            self.clean_orphaned_load_balancer(svc, lb, existing).await?;
            return Ok(true);
        }
        info!(lb = %lb.name, frontends = ?names, "removing frontends from load balancer");
        self.store.create_or_update_load_balancer(lb).await?;
        if let Some(fresh) = self
            .store
            .get_load_balancer(&lb.name, CacheReadType::Default)
            .await?
        {
            *lb = fresh;
        }
        Ok(false)
    }

    /// Delete a load balancer that has no frontend left. Load balancers with
    /// pre-configured pools or that were never created are left alone.
    pub async fn clean_orphaned_load_balancer(
        &self,
        svc: &Service,
        lb: &LoadBalancer,
        existing: &[LoadBalancer],
    ) -> Result<()> {
        if service::is_backend_pool_preconfigured(svc, &self.config) {
            debug!(lb = %lb.name, "backend pools are pre-configured, keeping empty load balancer");
            return Ok(());
        }
        if !existing.iter().any(|l| l.name.eq_ignore_ascii_case(&lb.name)) {
            return Ok(());
        }
        let vm_set = self.map_load_balancer_name_to_vm_set(&lb.name);
        self.safe_delete_load_balancer(svc, lb, &vm_set).await
    }

    async fn safe_delete_load_balancer(
        &self,
        svc: &Service,
        lb: &LoadBalancer,
        vm_set_name: &str,
    ) -> Result<()> {
        self.decouple_backend_pools(svc, lb, vm_set_name).await?;
        info!(lb = %lb.name, "deleting load balancer without frontends");
        self.store.delete_load_balancer(&lb.name).await?;

        if let Some(index) = self.multi_slb_index(&lb.name) {
            let released = {
                let mut active = self.placement.active_nodes.lock();
                active.get_mut(index).map(std::mem::take).unwrap_or_default()
            };
            let mut by_primary = self.placement.nodes_placed_by_primary.lock();
            for node in &released {
                by_primary.remove(node);
            }
            debug!(lb = %lb.name, nodes = released.len(), "released placed nodes");
        }
        Ok(())
    }

    /// Add the configured cluster tags. Returns whether any was added or changed.
    fn ensure_load_balancer_tagged(&self, lb: &mut LoadBalancer) -> bool {
        let wanted = self.config.parsed_tags();
        if wanted.is_empty() {
            return false;
        }
        config::reconcile_tags(&mut lb.tags, &wanted)
    }

    /// Put the service's nodes into the managed pools. In multi-SLB mode every
    /// load balancer is converged since nodes may have moved between them.
    async fn reconcile_backend_pool_hosts(
        &self,
        svc: &Service,
        nodes: &[Node],
        lb: &LoadBalancer,
        existing: &[LoadBalancer],
    ) -> Result<()> {
        let targets: Vec<&LoadBalancer> = if self.config.use_multiple_standard_load_balancers() {
            existing.iter().collect()
        } else {
            vec![lb]
        };
        for target in targets {
            for pool in &target.backend_address_pools {
                if self.managed_pool_family(&pool.name).is_none() {
                    continue;
                }
                self.ensure_hosts_in_pool(svc, nodes, pool, &target.name)
                    .await?;
            }
            self.store.invalidate_load_balancer(&target.name);
        }
        Ok(())
    }

    /// Converge one load balancer for the service.
    ///
    /// With `want_lb` the service's pools, frontends, rules and probes are
    /// ensured and its nodes are added to the pools. Without it, everything the
    /// service owns is removed and an emptied load balancer is deleted. The
    /// load balancer is written at most once.
    #[instrument(skip(self, svc, nodes), fields(service = %service::service_name(svc)))]
    pub async fn reconcile_load_balancer(
        &self,
        svc: &Service,
        nodes: Option<&[Node]>,
        want_lb: bool,
    ) -> Result<LoadBalancer> {
        let svc_name = service::service_name(svc);
        let mut preconfigured = service::is_backend_pool_preconfigured(svc, &self.config);
        let node_list = nodes.unwrap_or(&[]);

        let existing = self.list_managed_load_balancers(nodes).await?;
        self.rebuild_placement(svc, &existing, node_list).await?;
        let ServiceLoadBalancer {
            lb,
            existing: mut lbs,
            status,
            ..
        } = self
            .get_service_load_balancer(svc, node_list, want_lb, existing)
            .await?;
        let mut lb = lb;
        let lb_name = lb.name.clone();
        debug!(lb = %lb_name, want_lb, "reconciling load balancer");

        let mut dirty = false;
        if want_lb {
            let outcome = self.reconcile_backend_pools(svc, lb).await?;
            dirty |= outcome.changed;
            preconfigured = outcome.preconfigured;
            lb = outcome.lb;
            upsert(&mut lbs, &lb);
        }

        let frontends = self
            .reconcile_frontends(svc, &mut lb, status.as_ref(), want_lb)
            .await?;
        dirty |= frontends.changed;

        let mut frontend_ids: BTreeMap<bool, String> = [false, true]
            .into_iter()
            .map(|ipv6| {
                let name = naming::frontend_ip_config_name(svc, ipv6);
                (ipv6, self.frontend_ip_config_id(&lb_name, &name))
            })
            .collect();
        for (ipv6, fip) in &frontends.owned {
            frontend_ids.insert(*ipv6, fip.id().to_string());
        }

        let mut expected = rules::ExpectedRules::default();
        if want_lb {
            for ipv6 in service::ipv6_flags(svc) {
                let fip_id = frontend_ids.get(&ipv6).cloned().unwrap_or_default();
                rules::check_port_conflicts(svc, &lb, &fip_id)?;
                let pool_id = self.backend_pool_id(&lb_name, ipv6);
                let family = rules::expected_lb_rules(
                    &self.config,
                    svc,
                    &RuleTarget {
                        lb_name: &lb_name,
                        frontend_ip_config_id: &fip_id,
                        backend_pool_id: &pool_id,
                        ipv6,
                    },
                )?;
                expected.probes.extend(family.probes);
                expected.rules.extend(family.rules);
            }
        }

        dirty |= rule_diff::reconcile_probes(&mut lb, svc, want_lb, expected.probes);
        dirty |= rule_diff::reconcile_rules(&mut lb, svc, want_lb, expected.rules);
        dirty |= self.ensure_load_balancer_tagged(&mut lb);

        if dirty {
            for fip in &frontends.to_delete {
                if let Err(e) = self.reconcile_private_link_service(svc, fip, false).await {
                    warn!(frontend = %fip.name, error = %e, "failed to clean up private link service");
                }
            }

            if lb.frontend_ip_configurations.is_empty() {
                self.clean_orphaned_load_balancer(svc, &lb, &lbs).await?;
                lbs.retain(|l| !l.name.eq_ignore_ascii_case(&lb_name));
            } else {
                info!(lb = %lb_name, "writing load balancer");
                self.store.create_or_update_load_balancer(&lb).await?;
                lb = self
                    .store
                    .get_load_balancer(&lb_name, CacheReadType::Default)
                    .await?
                    .ok_or_else(|| Error::not_found("LoadBalancer", &lb_name))?;
                upsert(&mut lbs, &lb);
            }
        }

        if want_lb && !preconfigured {
            if let Some(nodes) = nodes {
                if self.config.use_multiple_standard_load_balancers() {
                    self.place_nodes(svc, &lb_name, &lbs, nodes).await?;
                }
                self.reconcile_backend_pool_hosts(svc, nodes, &lb, &lbs)
                    .await?;
            }
        }

        if frontends.changed {
            self.update_service_placement_status(want_lb, &svc_name, &lb_name);
        }
        Ok(lb)
    }
}
