//! Choosing the load balancer a service lives on.

use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, instrument};

use super::annotations;
use super::context::ReconcileContext;
use super::naming::{self, INTERNAL_LOAD_BALANCER_NAME_SUFFIX};
use super::selector;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{FrontendIpConfiguration, LoadBalancer, LoadBalancerSku};
use crate::error::{Error, Result};

/// Addresses a load balancer currently exposes for a service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceFrontendStatus {
    /// Ingress addresses: one per owned frontend, then the additional public IPs.
    pub ingress: Vec<String>,
    /// Addresses of the owned frontends only.
    pub primary_ips: Vec<String>,
    pub frontends: Vec<FrontendIpConfiguration>,
}

/// Result of locating the service's load balancer.
#[derive(Clone, Debug)]
pub struct ServiceLoadBalancer {
    pub lb: LoadBalancer,
    /// Listing refreshed after any move off another load balancer.
    pub existing: Vec<LoadBalancer>,
    pub status: Option<ServiceFrontendStatus>,
    pub exists: bool,
}

/// Pick a multi-SLB configuration: the current one while still eligible, then
/// an eligible one not created yet for this internal-ness, then the existing
/// one with the fewest rules.
pub fn most_eligible_load_balancer(
    current: Option<&str>,
    eligible: &[String],
    existing: &[LoadBalancer],
    internal: bool,
) -> String {
    if let Some(current) = current {
        if eligible.iter().any(|e| e == current) {
            debug!(lb = current, "keeping the eligible load balancer in use");
            return current.to_string();
        }
    }

    let same_kind = |lb: &&LoadBalancer| lb.is_internal() == internal;
    for candidate in eligible {
        let found = existing
            .iter()
            .filter(same_kind)
            .any(|lb| naming::trim_internal_suffix(&lb.name).eq_ignore_ascii_case(candidate));
        if !found {
            debug!(lb = %candidate, "choosing an eligible load balancer not created yet");
            return candidate.clone();
        }
    }

    let fewest = existing
        .iter()
        .filter(same_kind)
        .filter(|lb| {
            let base = naming::trim_internal_suffix(&lb.name);
            eligible.iter().any(|e| e == base)
        })
        .min_by_key(|lb| lb.load_balancing_rules.len());
    fewest
        .map(|lb| naming::trim_internal_suffix(&lb.name).to_string())
        .unwrap_or_default()
}

impl ReconcileContext {
    /// Name of the load balancer serving `vm_set_name` for this service.
    pub async fn azure_load_balancer_name(
        &self,
        svc: &Service,
        existing: &[LoadBalancer],
        vm_set_name: &str,
        internal: bool,
    ) -> Result<String> {
        let base = self.config.load_balancer_base_name();
        let single_standard = self.config.use_standard_load_balancer()
            && !self.config.use_multiple_standard_load_balancers();
        let mut prefix = if vm_set_name.eq_ignore_ascii_case(&self.primary_vm_set_name()) || single_standard
        {
            base.to_string()
        } else {
            vm_set_name.to_string()
        };

        if self.config.use_multiple_standard_load_balancers() {
            let eligible = self.eligible_load_balancers(svc).await?;
            let current = self.current_multi_slb_name(svc);
            prefix = most_eligible_load_balancer(
                current.as_deref(),
                &eligible,
                existing,
                service::requires_internal_load_balancer(svc),
            );
        }

        if internal {
            prefix.push_str(INTERNAL_LOAD_BALANCER_NAME_SUFFIX);
        }
        Ok(prefix)
    }

    /// Multi-SLB configuration the service is currently placed on.
    pub fn current_multi_slb_name(&self, svc: &Service) -> Option<String> {
        let name = service::service_name(svc).to_ascii_lowercase();
        let active = self.placement.active_services.lock();
        self.config
            .multiple_standard_load_balancer_configurations
            .iter()
            .zip(active.iter())
            .find(|(_, services)| services.contains(&name))
            .map(|(config, _)| config.name.clone())
    }

    fn is_service_on_configuration(&self, svc: &Service, index: usize) -> bool {
        let name = service::service_name(svc).to_ascii_lowercase();
        self.placement
            .active_services
            .lock()
            .get(index)
            .is_some_and(|s| s.contains(&name))
    }

    /// Multi-SLB configurations the service may be placed on, in declaration order.
    pub async fn eligible_load_balancers(&self, svc: &Service) -> Result<Vec<String>> {
        let configs = &self.config.multiple_standard_load_balancer_configurations;
        let svc_name = service::service_name(svc);

        let requested = annotations::load_balancer_configuration_names(svc);
        let mut candidates: Vec<usize> = if requested.is_empty() {
            (0..configs.len()).collect()
        } else {
            let chosen: Vec<usize> = (0..configs.len())
                .filter(|&i| requested.iter().any(|r| r == &configs[i].name))
                .collect();
            if chosen.is_empty() {
                return Err(Error::validation(format!(
                    "service {svc_name} selects {} load balancers by annotation, but none of them is configured",
                    requested.len()
                )));
            }
            chosen
        };
        let selected: Vec<String> = candidates.iter().map(|&i| configs[i].name.clone()).collect();

        let service_labels = svc.metadata.labels.clone().unwrap_or_default();
        let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
        let mut failed_placement = Vec::new();
        let mut failed_labels = Vec::new();
        let mut failed_namespace = Vec::new();
        let mut selector_matched = false;
        let mut eligible = Vec::new();

        for i in candidates.drain(..) {
            let config = &configs[i];
            if !config.allows_service_placement() && !self.is_service_on_configuration(svc, i) {
                debug!(lb = %config.name, "load balancer does not allow new services");
                failed_placement.push(config.name.clone());
                continue;
            }
            if let Some(sel) = &config.service_label_selector {
                if !selector::matches(sel, &service_labels)? {
                    failed_labels.push(config.name.clone());
                    continue;
                }
                selector_matched = true;
            }
            if let Some(sel) = &config.service_namespace_selector {
                let labels = self.lister.namespace_labels(namespace).await?;
                if !selector::matches(sel, &labels)? {
                    failed_namespace.push(config.name.clone());
                    continue;
                }
                selector_matched = true;
            }
            eligible.push(i);
        }

        if eligible.is_empty() {
            return Err(Error::validation(format!(
                "service {svc_name} selects {} load balancers ({}), but {} of them ({}) do not allow service placement, {} of them ({}) do not match the service label selector, and {} of them ({}) do not match the service namespace selector",
                selected.len(),
                selected.join(", "),
                failed_placement.len(),
                failed_placement.join(", "),
                failed_labels.len(),
                failed_labels.join(", "),
                failed_namespace.len(),
                failed_namespace.join(", "),
            )));
        }

        if selector_matched {
            eligible.retain(|&i| {
                configs[i].service_label_selector.is_some()
                    || configs[i].service_namespace_selector.is_some()
            });
        }
        Ok(eligible.into_iter().map(|i| configs[i].name.clone()).collect())
    }

    /// Whether a service found on `current` must move to `expected`.
    pub fn should_change_load_balancer(&self, svc: &Service, current: &str, expected: &str) -> bool {
        if self.config.use_standard_load_balancer() {
            return !current.eq_ignore_ascii_case(expected);
        }

        let mode = service::load_balancer_mode(svc);
        if !mode.specified || mode.auto {
            return false;
        }
        let primary = self.primary_vm_set_name();
        let base = self.config.load_balancer_base_name();
        let lb_vm_set = naming::trim_internal_suffix(current);
        // Only the first requested set matters for a pinned service.
        let vm_set = mode.vm_sets.first().map(String::as_str).unwrap_or_default();
        if lb_vm_set.eq_ignore_ascii_case(vm_set) {
            return !lb_vm_set.eq_ignore_ascii_case(base) && primary.eq_ignore_ascii_case(vm_set);
        }
        if vm_set.eq_ignore_ascii_case(&primary) && base.eq_ignore_ascii_case(lb_vm_set) {
            return false;
        }
        true
    }

    /// VM sets a basic-SKU service may use, per its mode annotation.
    async fn service_vm_sets(&self, svc: &Service, nodes: &[Node]) -> Result<Vec<String>> {
        let mode = service::load_balancer_mode(svc);
        if !mode.specified {
            return Ok(vec![self.primary_vm_set_name()]);
        }
        let available = self.vm_set().vm_set_names(nodes).await?;
        if mode.auto {
            return Ok(available);
        }
        let mut chosen = Vec::new();
        for wanted in &mode.vm_sets {
            match available.iter().find(|a| a.eq_ignore_ascii_case(wanted)) {
                Some(found) => chosen.push(found.clone()),
                None => {
                    return Err(Error::validation(format!(
                        "VM set {wanted:?} requested by service {} does not exist",
                        service::service_name(svc)
                    )))
                }
            }
        }
        Ok(chosen)
    }

    /// Basic SKU only: the candidate load balancer with the fewest rules, or a
    /// not yet created one. Returns `(lb, exists)`.
    pub async fn select_load_balancer(
        &self,
        svc: &Service,
        existing: &[LoadBalancer],
        nodes: &[Node],
    ) -> Result<(LoadBalancer, bool)> {
        let internal = service::requires_internal_load_balancer(svc);
        let svc_name = service::service_name(svc);
        let vm_sets = self.service_vm_sets(svc, nodes).await?;

        let mut names = Vec::with_capacity(vm_sets.len());
        for vm_set in &vm_sets {
            names.push(
                self.azure_load_balancer_name(svc, existing, vm_set, internal)
                    .await?,
            );
        }
        names.sort();
        names.dedup();

        let mut selected: Option<&LoadBalancer> = None;
        for name in &names {
            let Some(lb) = existing.iter().find(|lb| &lb.name == name) else {
                info!(service = %svc_name, lb = %name, "selecting a new load balancer");
                let sku = if self.config.use_standard_load_balancer() {
                    LoadBalancerSku::Standard
                } else {
                    LoadBalancerSku::Basic
                };
                return Ok((
                    LoadBalancer {
                        name: name.clone(),
                        location: Some(self.config.location.clone()),
                        sku: Some(sku),
                        ..Default::default()
                    },
                    false,
                ));
            };
            if selected.map_or(true, |s| lb.load_balancing_rules.len() < s.load_balancing_rules.len()) {
                selected = Some(lb);
            }
        }

        let Some(selected) = selected else {
            return Err(Error::validation(format!(
                "unable to find a load balancer for service {svc_name} among VM sets {vm_sets:?}"
            )));
        };
        let max = self.config.maximum_load_balancer_rule_count;
        if max != 0 && selected.load_balancing_rules.len() >= max {
            return Err(Error::validation(format!(
                "all load balancers for service {svc_name} have reached the maximum rule count {max}"
            )));
        }
        Ok((selected.clone(), true))
    }

    /// Addresses the load balancer exposes for the service, `None` when the
    /// service owns no frontend on it.
    pub async fn service_load_balancer_status(
        &self,
        svc: &Service,
        lb: &LoadBalancer,
    ) -> Result<Option<ServiceFrontendStatus>> {
        let internal = service::requires_internal_load_balancer(svc);
        let rg = service::public_ip_resource_group(svc, &self.config);
        let mut status = ServiceFrontendStatus::default();
        for frontend in &lb.frontend_ip_configurations {
            let (owns, primary, _) = self.service_owns_frontend(frontend, svc).await?;
            if !owns {
                continue;
            }
            debug!(lb = %lb.name, frontend = %frontend.name, primary, "found service frontend");
            let ip = if internal {
                frontend.private_ip_address.clone()
            } else {
                let Some(pip_ref) = &frontend.public_ip_address else {
                    return Err(Error::validation(format!(
                        "frontend {} of load balancer {} has no public IP",
                        frontend.name, lb.name
                    )));
                };
                let pip_name = naming::last_segment(&pip_ref.id)?;
                self.store
                    .get_public_ip(&rg, pip_name, CacheReadType::Default)
                    .await?
                    .and_then(|pip| pip.ip_address)
            };
            let ip = ip.unwrap_or_default();
            status.ingress.push(ip.clone());
            status.primary_ips.push(ip);
            status.frontends.push(frontend.clone());
        }
        if status.ingress.is_empty() {
            return Ok(None);
        }
        status.ingress.extend(service::additional_public_ips(svc)?);
        Ok(Some(status))
    }

    /// Locate the service's load balancer. With `want_lb`, a service sitting on
    /// the wrong load balancer is first removed from it.
    #[instrument(skip(self, svc, nodes, existing), fields(service = %service::service_name(svc)))]
    pub async fn get_service_load_balancer(
        &self,
        svc: &Service,
        nodes: &[Node],
        want_lb: bool,
        mut existing: Vec<LoadBalancer>,
    ) -> Result<ServiceLoadBalancer> {
        let internal = service::requires_internal_load_balancer(svc);
        let primary = self.primary_vm_set_name();
        let default_name = self
            .azure_load_balancer_name(svc, &existing, &primary, internal)
            .await?;
        if existing.is_empty() {
            existing = self.store.list_load_balancers().await?;
        }

        let mut should_change = false;
        let candidates: Vec<LoadBalancer> = existing
            .iter()
            .filter(|lb| lb.is_internal() == internal)
            .cloned()
            .collect();
        for candidate in candidates {
            let Some(status) = self.service_load_balancer_status(svc, &candidate).await? else {
                continue;
            };
            if want_lb && self.should_change_load_balancer(svc, &candidate.name, &default_name) {
                info!(from = %candidate.name, to = %default_name, "moving service to another load balancer");
                should_change = true;
                let mut old = candidate;
                let deleted = self
                    .remove_frontends_from_load_balancer(svc, &mut old, &status.frontends, &existing)
                    .await?;
                if deleted {
                    existing.retain(|lb| !lb.name.eq_ignore_ascii_case(&old.name));
                } else if let Some(slot) = existing.iter_mut().find(|lb| lb.name == old.name) {
                    *slot = old.clone();
                }
                self.update_service_placement_status(false, &service::service_name(svc), &old.name);
                break;
            }
            return Ok(ServiceLoadBalancer {
                lb: candidate,
                existing,
                status: Some(status),
                exists: true,
            });
        }

        if want_lb && !self.config.use_standard_load_balancer() {
            let (lb, exists) = self.select_load_balancer(svc, &existing, nodes).await?;
            return Ok(ServiceLoadBalancer {
                lb,
                existing,
                status: None,
                exists,
            });
        }

        if let Some(lb) = existing
            .iter()
            .find(|lb| lb.name.eq_ignore_ascii_case(&default_name))
            .cloned()
        {
            if should_change {
                debug!(lb = %lb.name, "service moves onto an existing load balancer");
            }
            return Ok(ServiceLoadBalancer {
                lb,
                existing,
                status: None,
                exists: should_change,
            });
        }

        let sku = self
            .config
            .use_standard_load_balancer()
            .then_some(LoadBalancerSku::Standard);
        Ok(ServiceLoadBalancer {
            lb: LoadBalancer {
                name: default_name,
                location: Some(self.config.location.clone()),
                sku,
                ..Default::default()
            },
            existing,
            status: None,
            exists: false,
        })
    }
}
