//! Frontend IP configuration ownership and convergence.
//!
//! The primary service owns frontends named with its rule prefix. Secondary
//! services share a frontend by pinning its address, through the load
//! balancer IP or the public IP name annotations.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, warn};

use super::context::ReconcileContext;
use super::naming;
use super::rule_diff::service_owns_rule;
use super::selection::ServiceFrontendStatus;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{
    FrontendIpConfiguration, IpAllocationMethod, IpVersion, LoadBalancer, SubResource, Subnet,
};
use crate::error::{Error, Result};

pub const DELETING_FRONTEND_EVENT_REASON: &str = "DeletingFrontendIPConfiguration";

/// Outcome of [`ReconcileContext::reconcile_frontends`].
#[derive(Clone, Debug, Default)]
pub struct FrontendOutcome {
    /// Frontends the service owns after the pass, keyed by family.
    pub owned: BTreeMap<bool, FrontendIpConfiguration>,
    pub to_delete: Vec<FrontendIpConfiguration>,
    pub changed: bool,
}

fn references(sub: Option<&SubResource>, id: &str) -> bool {
    sub.is_some_and(|s| s.same_as(id))
}

impl ReconcileContext {
    /// `(owns, primary, version)`. The version is known only for secondary
    /// ownership, where the shared address was resolved.
    pub async fn service_owns_frontend(
        &self,
        fip: &FrontendIpConfiguration,
        svc: &Service,
    ) -> Result<(bool, bool, Option<IpVersion>)> {
        if fip.name.starts_with(&naming::rule_prefix(svc)) {
            return Ok((true, true, None));
        }
        let internal = service::requires_internal_load_balancer(svc);
        let lb_ips = service::load_balancer_ips(svc);

        if lb_ips.is_empty() {
            if internal {
                return Ok((false, false, None));
            }
            for name in service::pip_names(svc) {
                if let Some(pip) = self.find_matched_public_ip(svc, None, Some(&name)).await? {
                    if let Some(id) = &pip.id {
                        if references(fip.public_ip_address.as_ref(), id) {
                            return Ok((true, false, Some(pip.version())));
                        }
                    }
                }
            }
            return Ok((false, false, None));
        }

        if !internal {
            for ip in &lb_ips {
                let Some(pip) = self.find_matched_public_ip(svc, Some(ip), None).await? else {
                    continue;
                };
                if let Some(id) = &pip.id {
                    if references(fip.public_ip_address.as_ref(), id) {
                        return Ok((true, false, Some(pip.version())));
                    }
                }
            }
            return Ok((false, false, None));
        }

        let Some(private_ip) = fip.private_ip_address.as_deref() else {
            return Ok((false, false, None));
        };
        let version = match private_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => IpVersion::IPv6,
            _ => IpVersion::IPv4,
        };
        let owns = lb_ips.iter().any(|ip| ip.eq_ignore_ascii_case(private_ip));
        Ok((owns, false, Some(version)))
    }

    /// Address family of a frontend the service owns.
    pub async fn is_frontend_ipv6(&self, svc: &Service, fip: &FrontendIpConfiguration) -> Result<bool> {
        if !service::is_dual_stack(svc) {
            let (_, v6) = service::ip_families(svc);
            return Ok(v6);
        }
        if service::requires_internal_load_balancer(svc) {
            return Ok(fip.private_ip_address_version.unwrap_or_default().is_ipv6());
        }
        if let Some(pip_ref) = &fip.public_ip_address {
            let rg = service::public_ip_resource_group(svc, &self.config);
            let name = naming::last_segment(&pip_ref.id)?;
            if let Some(pip) = self.store.get_public_ip(&rg, name, CacheReadType::Default).await? {
                return Ok(pip.version().is_ipv6());
            }
        }
        Ok(naming::has_ipv6_suffix(&fip.name))
    }

    async fn owned_frontend_family(
        &self,
        svc: &Service,
        fip: &FrontendIpConfiguration,
        version: Option<IpVersion>,
    ) -> Result<bool> {
        match version {
            Some(v) => Ok(v.is_ipv6()),
            None => self.is_frontend_ipv6(svc, fip).await,
        }
    }

    /// Owned frontends of `configs`, keyed by family.
    pub async fn frontends_of_service(
        &self,
        configs: &[FrontendIpConfiguration],
        svc: &Service,
    ) -> Result<BTreeMap<bool, FrontendIpConfiguration>> {
        let mut out = BTreeMap::new();
        for fip in configs {
            let (owns, _, version) = self.service_owns_frontend(fip, svc).await?;
            if owns {
                let ipv6 = self.owned_frontend_family(svc, fip, version).await?;
                out.insert(ipv6, fip.clone());
            }
        }
        Ok(out)
    }

    /// A frontend is unsafe to delete while rules of other services, outbound
    /// rules, inbound NAT rules or inbound NAT pools reference it. Each
    /// blocker raises a warning event.
    pub async fn is_frontend_unsafe_to_delete(
        &self,
        lb: &LoadBalancer,
        svc: &Service,
        fip_id: &str,
    ) -> Result<bool> {
        if fip_id.is_empty() {
            return Err(Error::validation(format!(
                "frontend on load balancer {} has no ID",
                lb.name
            )));
        }
        let mut blockers = Vec::new();
        if lb.load_balancing_rules.iter().any(|r| {
            references(r.frontend_ip_configuration.as_ref(), fip_id) && !service_owns_rule(svc, &r.name)
        }) {
            blockers.push("load balancing rules of other services".to_string());
        }
        if let Some(rule) = lb
            .outbound_rules
            .iter()
            .find(|r| r.frontend_ip_configurations.iter().any(|f| f.same_as(fip_id)))
        {
            blockers.push(format!("the outbound rule {}", rule.name));
        }
        if let Some(rule) = lb
            .inbound_nat_rules
            .iter()
            .find(|r| references(r.frontend_ip_configuration.as_ref(), fip_id))
        {
            blockers.push(format!("the inbound NAT rule {}", rule.name));
        }
        if let Some(pool) = lb
            .inbound_nat_pools
            .iter()
            .find(|p| references(p.frontend_ip_configuration.as_ref(), fip_id))
        {
            blockers.push(format!("the inbound NAT pool {}", pool.name));
        }

        for blocker in &blockers {
            let message = format!(
                "frontend IP configuration {fip_id} on load balancer {} cannot be deleted because it is referenced by {blocker}",
                lb.name
            );
            warn!(service = %service::service_name(svc), "{message}");
            self.events
                .warn(svc, DELETING_FRONTEND_EVENT_REASON, &message)
                .await;
        }
        Ok(!blockers.is_empty())
    }

    async fn is_frontend_changed(
        &self,
        fip: &FrontendIpConfiguration,
        svc: &Service,
        expected_name: &str,
        subnet: Option<&Subnet>,
    ) -> Result<bool> {
        let (owns, primary, version) = self.service_owns_frontend(fip, svc).await?;
        if owns && primary && !fip.name.eq_ignore_ascii_case(expected_name) {
            return Ok(true);
        }
        if !fip.name.eq_ignore_ascii_case(expected_name) {
            return Ok(false);
        }
        let ipv6 = self.owned_frontend_family(svc, fip, version).await?;
        let lb_ip = service::load_balancer_ip(svc, ipv6);

        if service::requires_internal_load_balancer(svc) {
            if service::internal_subnet(svc).is_some() {
                let want = subnet.and_then(|s| s.id.as_deref()).unwrap_or_default();
                if let Some(have) = &fip.subnet {
                    if !have.same_as(want) {
                        return Ok(true);
                    }
                }
            }
            return Ok(lb_ip.is_some_and(|ip| {
                !ip.eq_ignore_ascii_case(fip.private_ip_address.as_deref().unwrap_or_default())
            }));
        }

        let (pip_name, _) = self.determine_public_ip_name(svc, ipv6).await?;
        let rg = service::public_ip_resource_group(svc, &self.config);
        let Some(pip) = self.store.get_public_ip(&rg, &pip_name, CacheReadType::Default).await? else {
            return Ok(true);
        };
        Ok(match (&fip.public_ip_address, &pip.id) {
            (Some(have), Some(want)) => !have.same_as(want),
            (Some(_), None) => true,
            _ => false,
        })
    }

    async fn service_subnet(&self, svc: &Service) -> Result<Subnet> {
        let name = service::internal_subnet(svc).unwrap_or(self.config.subnet_name.as_str());
        self.store
            .get_subnet(&self.config.vnet_name, name)
            .await?
            .ok_or_else(|| Error::not_found("Subnet", &format!("{}/{name}", self.config.vnet_name)))
    }

    /// Converge the frontends of `lb` for the service. Without `want_lb`, owned
    /// frontends are dropped unless still referenced; otherwise changed ones
    /// are replaced and missing families are added.
    pub async fn reconcile_frontends(
        &self,
        svc: &Service,
        lb: &mut LoadBalancer,
        status: Option<&ServiceFrontendStatus>,
        want_lb: bool,
    ) -> Result<FrontendOutcome> {
        let svc_name = service::service_name(svc);
        let internal = service::requires_internal_load_balancer(svc);
        let mut outcome = FrontendOutcome::default();
        let mut configs = lb.frontend_ip_configurations.clone();

        if !want_lb {
            let mut kept = Vec::with_capacity(configs.len());
            for fip in configs {
                let (owns, _, _) = self.service_owns_frontend(&fip, svc).await?;
                if owns && !self.is_frontend_unsafe_to_delete(lb, svc, fip.id()).await? {
                    info!(service = %svc_name, lb = %lb.name, frontend = %fip.name, "dropping frontend");
                    outcome.to_delete.push(fip);
                    outcome.changed = true;
                } else {
                    kept.push(fip);
                }
            }
            if outcome.changed {
                lb.frontend_ip_configurations = kept;
            }
            return Ok(outcome);
        }

        let subnet = if internal {
            Some(self.service_subnet(svc).await?)
        } else {
            None
        };

        let mut previous_zones: Option<Vec<String>> = None;
        let mut replaced = false;
        let mut kept = Vec::with_capacity(configs.len());
        for fip in configs.drain(..) {
            let (owns, _, version) = self.service_owns_frontend(&fip, svc).await?;
            if !owns {
                kept.push(fip);
                continue;
            }
            let ipv6 = self.owned_frontend_family(svc, &fip, version).await?;
            let expected = naming::frontend_ip_config_name(svc, ipv6);
            if self
                .is_frontend_changed(&fip, svc, &expected, subnet.as_ref())
                .await?
            {
                info!(service = %svc_name, lb = %lb.name, frontend = %fip.name, "dropping changed frontend");
                previous_zones = fip.zones.clone();
                replaced = true;
                outcome.to_delete.push(fip);
                outcome.changed = true;
            } else {
                kept.push(fip);
            }
        }
        configs = kept;

        outcome.owned = self.frontends_of_service(&configs, svc).await?;
        let (v4, v6) = service::ip_families(svc);
        for (ipv6, enabled) in [(false, v4), (true, v6)] {
            if !enabled || outcome.owned.contains_key(&ipv6) {
                continue;
            }
            let name = naming::frontend_ip_config_name(svc, ipv6);
            debug!(service = %svc_name, lb = %lb.name, frontend = %name, ipv6, "creating frontend");
            let mut fip = FrontendIpConfiguration {
                id: Some(self.frontend_ip_config_id(&lb.name, &name)),
                name,
                ..Default::default()
            };
            match &subnet {
                Some(subnet) => {
                    fip.subnet = subnet.id.clone().map(SubResource::new);
                    if ipv6 {
                        fip.private_ip_address_version = Some(IpVersion::IPv6);
                    }
                    let ingress_in_subnet = status.and_then(|s| {
                        s.ingress.iter().find(|ip| {
                            matches!(ip.parse::<IpAddr>(), Ok(addr) if addr.is_ipv6() == ipv6)
                                && subnet.contains_ip(ip)
                        })
                    });
                    if let Some(ip) = service::load_balancer_ip(svc, ipv6) {
                        fip.private_ip_allocation_method = Some(IpAllocationMethod::Static);
                        fip.private_ip_address = Some(ip);
                    } else if let Some(ip) = ingress_in_subnet {
                        debug!(service = %svc_name, ip = %ip, "keeping the previous private IP");
                        fip.private_ip_allocation_method = Some(IpAllocationMethod::Static);
                        fip.private_ip_address = Some(ip.clone());
                    } else {
                        fip.private_ip_allocation_method = Some(IpAllocationMethod::Dynamic);
                    }
                    fip.zones = if replaced {
                        previous_zones.clone()
                    } else {
                        let zones = self.region_zones().await?;
                        (self.config.use_standard_load_balancer() && !zones.is_empty())
                            .then_some(zones)
                    };
                }
                None => {
                    let (pip_name, should_exist) = self.determine_public_ip_name(svc, ipv6).await?;
                    let pip = self
                        .ensure_public_ip_exists(svc, &pip_name, should_exist, ipv6)
                        .await?;
                    let id = pip
                        .id
                        .ok_or_else(|| Error::not_found("PublicIPAddress", &pip_name))?;
                    fip.public_ip_address = Some(SubResource::new(id));
                }
            }
            info!(service = %svc_name, lb = %lb.name, frontend = %fip.name, "adding frontend");
            outcome.owned.insert(ipv6, fip.clone());
            configs.push(fip);
            outcome.changed = true;
        }

        if outcome.changed {
            lb.frontend_ip_configurations = configs;
        }
        Ok(outcome)
    }
}
