//! Public IP ownership, sharing and lifecycle.
//!
//! A public IP records the services bound to it in a comma separated tag.
//! Addresses without that tag, or named by the service through annotation,
//! are user-assigned and never deleted by the reconciler.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, instrument, warn};

use super::annotations;
use super::context::ReconcileContext;
use super::naming;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{
    DnsSettings, IpAllocationMethod, IpTag, IpVersion, LoadBalancer, PublicIpAddress, PublicIpSku,
    SubResource,
};
use crate::config::reconcile_tags;
use crate::error::{Error, Result};

pub const SERVICE_TAG_KEY: &str = "k8s-azure-service";
pub const LEGACY_SERVICE_TAG_KEY: &str = "service";
pub const CLUSTER_NAME_KEY: &str = "k8s-azure-cluster-name";
pub const LEGACY_CLUSTER_NAME_KEY: &str = "kubernetes-cluster-name";
pub const SERVICE_USING_DNS_KEY: &str = "k8s-azure-dns-label-service";
pub const LEGACY_SERVICE_USING_DNS_KEY: &str = "kubernetes-dns-label-service";

fn tag_value<'a>(tags: &'a BTreeMap<String, String>, key: &str, legacy: &str) -> Option<&'a str> {
    tags.get(key)
        .or_else(|| tags.get(legacy))
        .map(String::as_str)
}

/// Services bound to the address, comma separated.
pub fn service_tag(pip: &PublicIpAddress) -> Option<&str> {
    tag_value(&pip.tags, SERVICE_TAG_KEY, LEGACY_SERVICE_TAG_KEY)
}

pub fn cluster_tag(pip: &PublicIpAddress) -> Option<&str> {
    tag_value(&pip.tags, CLUSTER_NAME_KEY, LEGACY_CLUSTER_NAME_KEY)
}

/// Service whose DNS label the address carries.
pub fn dns_service_tag(pip: &PublicIpAddress) -> Option<&str> {
    tag_value(&pip.tags, SERVICE_USING_DNS_KEY, LEGACY_SERVICE_USING_DNS_KEY)
}

pub fn parse_service_tag(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn bound_services(pip: &PublicIpAddress) -> Vec<String> {
    service_tag(pip).map(parse_service_tag).unwrap_or_default()
}

fn lists_service(services: &[String], name: &str) -> bool {
    services.iter().any(|s| s.eq_ignore_ascii_case(name))
}

fn set_bound_services(pip: &mut PublicIpAddress, services: &[String]) {
    pip.tags.remove(LEGACY_SERVICE_TAG_KEY);
    pip.tags
        .insert(SERVICE_TAG_KEY.to_string(), services.join(","));
}

/// Add `names` to the service tag. Returns whether the tag changed.
pub fn bind_services_to_pip(pip: &mut PublicIpAddress, names: &[String]) -> bool {
    let mut services = bound_services(pip);
    let had_tag = service_tag(pip).is_some();
    let mut changed = false;
    for name in names {
        if !lists_service(&services, name) {
            services.push(name.clone());
            changed = true;
        }
    }
    if changed || !had_tag {
        set_bound_services(pip, &services);
        return true;
    }
    false
}

/// Remove the service from the address's tags. The DNS owner tag is dropped
/// for user-assigned addresses too.
pub fn unbind_service_from_pip(pip: &mut PublicIpAddress, svc_name: &str, user_assigned: bool) {
    if dns_service_tag(pip).is_some_and(|owner| owner.eq_ignore_ascii_case(svc_name)) {
        pip.tags.remove(SERVICE_USING_DNS_KEY);
        pip.tags.remove(LEGACY_SERVICE_USING_DNS_KEY);
    }
    if user_assigned {
        return;
    }
    let services: Vec<String> = bound_services(pip)
        .into_iter()
        .filter(|s| !s.eq_ignore_ascii_case(svc_name))
        .collect();
    set_bound_services(pip, &services);
}

/// Whether the service selects this address through a name or address
/// annotation.
pub fn is_service_selecting_pip(svc: &Service, pip: &PublicIpAddress) -> bool {
    let ipv6 = pip.version().is_ipv6();
    if let Some(name) = service::pip_name(svc, ipv6) {
        if name.eq_ignore_ascii_case(&pip.name) {
            return true;
        }
    }
    match (service::load_balancer_ip(svc, ipv6), pip.ip_address.as_deref()) {
        (Some(want), Some(have)) => want == have,
        _ => false,
    }
}

/// `(owns, user_assigned)` for the service and address.
pub fn service_owns_public_ip(
    svc: &Service,
    pip: &PublicIpAddress,
    cluster_name: &str,
) -> (bool, bool) {
    if pip.ip_address.as_deref().unwrap_or_default().is_empty() {
        // Not allocated yet: ownership only through the service tag.
        let owns = lists_service(&bound_services(pip), &service::service_name(svc));
        return (owns, false);
    }
    let Some(tag) = service_tag(pip) else {
        return (is_service_selecting_pip(svc, pip), true);
    };
    if let Some(cluster) = cluster_tag(pip) {
        if !cluster.is_empty() && !cluster.eq_ignore_ascii_case(cluster_name) {
            return (false, false);
        }
    }
    if lists_service(&parse_service_tag(tag), &service::service_name(svc)) {
        return (true, false);
    }
    (is_service_selecting_pip(svc, pip), false)
}

/// IP tags requested by annotation, sorted.
pub fn requested_ip_tags(svc: &Service) -> Option<Vec<IpTag>> {
    annotations::ip_tags(svc).map(|tags| {
        tags.into_iter()
            .map(|(ip_tag_type, tag)| IpTag { ip_tag_type, tag })
            .collect()
    })
}

fn ip_tags_equivalent(current: &[IpTag], wanted: &[IpTag]) -> bool {
    let mut a = current.to_vec();
    let mut b = wanted.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// An owned address is released when no other service is bound to it and it
/// is no longer the desired address.
pub fn should_release_owned_public_ip(
    pip: &PublicIpAddress,
    want_lb: bool,
    internal: bool,
    user_assigned: bool,
    desired_name: &str,
    requested_ip_tags: Option<&[IpTag]>,
) -> bool {
    if user_assigned {
        return false;
    }
    let services = bound_services(pip);
    if !want_lb && !services.is_empty() {
        return false;
    }
    if want_lb && services.len() > 1 {
        return false;
    }
    let tags_changed = requested_ip_tags.is_some_and(|want| !ip_tags_equivalent(&pip.ip_tags, want));
    !want_lb || internal || !pip.name.eq_ignore_ascii_case(desired_name) || tags_changed
}

/// Apply the DNS label annotation. A label owned by another service is an error.
pub fn reconcile_dns_settings(
    pip: &mut PublicIpAddress,
    label: &str,
    svc_name: &str,
    user_assigned: bool,
) -> Result<bool> {
    let current = pip.domain_name_label().unwrap_or_default().to_string();
    if current.eq_ignore_ascii_case(label) {
        return Ok(false);
    }
    if let Some(owner) = dns_service_tag(pip) {
        if !owner.is_empty() && !owner.eq_ignore_ascii_case(svc_name) && !current.is_empty() {
            return Err(Error::OwnershipConflict(format!(
                "public IP {} DNS label {current:?} is used by service {owner}",
                pip.name
            )));
        }
    }
    if label.is_empty() {
        pip.dns_settings = None;
    } else {
        pip.dns_settings = Some(DnsSettings {
            domain_name_label: Some(label.to_string()),
        });
    }
    if !user_assigned || !label.is_empty() {
        pip.tags.remove(LEGACY_SERVICE_USING_DNS_KEY);
        pip.tags
            .insert(SERVICE_USING_DNS_KEY.to_string(), svc_name.to_string());
    }
    Ok(true)
}

/// Address version and, for IPv6, the allocation method the SKU requires.
fn reconcile_ip_settings(pip: &mut PublicIpAddress, ipv6: bool, standard: bool) -> bool {
    let mut changed = false;
    let version = IpVersion::from_is_ipv6(ipv6);
    if pip.version() != version {
        pip.public_ip_address_version = Some(version);
        changed = true;
    }
    if ipv6 {
        let method = if standard {
            IpAllocationMethod::Static
        } else {
            IpAllocationMethod::Dynamic
        };
        if pip.allocation_method() != method {
            pip.public_ip_allocation_method = Some(method);
            changed = true;
        }
    }
    changed
}

impl ReconcileContext {
    /// `(name, from_annotation)` of the address the service should use.
    pub async fn determine_public_ip_name(&self, svc: &Service, ipv6: bool) -> Result<(String, bool)> {
        if let Some(name) = service::pip_name(svc, ipv6) {
            return Ok((name.to_string(), true));
        }
        if service::pip_prefix_id(svc, ipv6).is_some() {
            return Ok((naming::public_ip_name(self.cluster_name(), svc, ipv6), false));
        }
        let Some(ip) = service::load_balancer_ip(svc, ipv6) else {
            return Ok((naming::public_ip_name(self.cluster_name(), svc, ipv6), false));
        };
        let rg = service::public_ip_resource_group(svc, &self.config);
        match self.store.find_public_ip_by_address(&rg, &ip).await? {
            Some(pip) => Ok((pip.name, false)),
            None => Err(Error::not_found("PublicIPAddress", &ip)),
        }
    }

    /// Address carrying `ip`, or named `name`, in the service's resource group.
    pub async fn find_matched_public_ip(
        &self,
        svc: &Service,
        ip: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<PublicIpAddress>> {
        let rg = service::public_ip_resource_group(svc, &self.config);
        if let Some(name) = name {
            if let Some(pip) = self.store.get_public_ip(&rg, name, CacheReadType::Default).await? {
                return Ok(Some(pip));
            }
        }
        match ip {
            Some(ip) => self.store.find_public_ip_by_address(&rg, ip).await,
            None => Ok(None),
        }
    }

    fn ensure_pip_tagged(&self, svc: &Service, pip: &mut PublicIpAddress) -> bool {
        let mut wanted = self.config.parsed_tags();
        reconcile_tags(&mut wanted, &annotations::pip_tags(svc));
        for (key, value) in [
            (CLUSTER_NAME_KEY, cluster_tag(pip)),
            (SERVICE_TAG_KEY, service_tag(pip)),
            (SERVICE_USING_DNS_KEY, dns_service_tag(pip)),
        ] {
            if let Some(value) = value {
                wanted.insert(key.to_string(), value.to_string());
            }
        }
        reconcile_tags(&mut pip.tags, &wanted)
    }

    /// Create or adopt the named address and bring its tags, DNS label and IP
    /// settings in line with the service.
    #[instrument(skip(self, svc), fields(service = %service::service_name(svc)))]
    pub async fn ensure_public_ip_exists(
        &self,
        svc: &Service,
        pip_name: &str,
        should_exist: bool,
        ipv6: bool,
    ) -> Result<PublicIpAddress> {
        let rg = service::public_ip_resource_group(svc, &self.config);
        let svc_name = service::service_name(svc);
        let dns_label = annotations::get(svc, annotations::DNS_LABEL_NAME);
        let standard = self.config.use_standard_load_balancer();

        let existing = self
            .store
            .get_public_ip(&rg, pip_name, CacheReadType::Default)
            .await?;
        let (mut pip, user_assigned, mut changed) = match existing {
            Some(mut pip) => {
                let (owns, user_assigned) = service_owns_public_ip(svc, &pip, self.cluster_name());
                let mut changed = false;
                if owns && !user_assigned {
                    changed = bind_services_to_pip(&mut pip, std::slice::from_ref(&svc_name));
                }
                let label_matches = pip
                    .domain_name_label()
                    .unwrap_or_default()
                    .eq_ignore_ascii_case(dns_label.unwrap_or_default());
                let dns_owned = dns_service_tag(&pip)
                    .is_some_and(|owner| owner.eq_ignore_ascii_case(&svc_name));
                if label_matches && dns_owned && !changed {
                    return Ok(pip);
                }
                (pip, user_assigned, changed)
            }
            None => {
                if should_exist {
                    return Err(Error::not_found("PublicIPAddress", pip_name));
                }
                info!(pip = %pip_name, "creating public IP");
                let mut pip = PublicIpAddress {
                    name: pip_name.to_string(),
                    location: Some(self.config.location.clone()),
                    public_ip_allocation_method: Some(IpAllocationMethod::Static),
                    public_ip_address_version: Some(IpVersion::from_is_ipv6(ipv6)),
                    ip_tags: requested_ip_tags(svc).unwrap_or_default(),
                    ..Default::default()
                };
                pip.tags.insert(SERVICE_TAG_KEY.to_string(), String::new());
                pip.tags
                    .insert(CLUSTER_NAME_KEY.to_string(), self.cluster_name().to_string());
                bind_services_to_pip(&mut pip, std::slice::from_ref(&svc_name));
                if standard {
                    pip.sku = Some(PublicIpSku::Standard);
                    if let Some(prefix) = service::pip_prefix_id(svc, ipv6) {
                        pip.public_ip_prefix = Some(SubResource::new(prefix));
                    }
                    let zones = self.region_zones().await?;
                    if !zones.is_empty() {
                        pip.zones = Some(zones);
                    }
                }
                (pip, false, true)
            }
        };

        if !user_assigned {
            changed |= self.ensure_pip_tagged(svc, &mut pip);
        }
        if let Some(label) = dns_label {
            changed |= reconcile_dns_settings(&mut pip, label, &svc_name, user_assigned)?;
        }
        changed |= reconcile_ip_settings(&mut pip, ipv6, standard);

        if changed {
            debug!(pip = %pip.name, "writing public IP");
            self.store.create_or_update_public_ip(&rg, &pip).await?;
        }
        self.store
            .get_public_ip(&rg, pip_name, CacheReadType::Default)
            .await?
            .ok_or_else(|| Error::not_found("PublicIPAddress", pip_name))
    }

    /// Converge the service's public IPs for every family it requests.
    ///
    /// Releases owned addresses the service no longer needs, then ensures the
    /// desired one. Returns the desired addresses.
    #[instrument(skip(self, svc), fields(service = %service::service_name(svc)))]
    pub async fn reconcile_public_ips(
        &self,
        svc: &Service,
        lb_name: Option<&str>,
        want_lb: bool,
    ) -> Result<Vec<PublicIpAddress>> {
        let rg = service::public_ip_resource_group(svc, &self.config);
        let all = self.store.list_public_ips(&rg, CacheReadType::Default).await?;
        let mut lb = match lb_name {
            Some(name) => self.store.get_load_balancer(name, CacheReadType::Default).await?,
            None => None,
        };
        let mut desired = Vec::new();
        for ipv6 in service::ipv6_flags(svc) {
            let family: Vec<PublicIpAddress> = all
                .iter()
                .filter(|p| p.version().is_ipv6() == ipv6)
                .cloned()
                .collect();
            if let Some(pip) = self
                .reconcile_public_ip(svc, &rg, family, lb.as_mut(), want_lb, ipv6)
                .await?
            {
                desired.push(pip);
            }
        }
        Ok(desired)
    }

    async fn reconcile_public_ip(
        &self,
        svc: &Service,
        rg: &str,
        pips: Vec<PublicIpAddress>,
        mut lb: Option<&mut LoadBalancer>,
        want_lb: bool,
        ipv6: bool,
    ) -> Result<Option<PublicIpAddress>> {
        let internal = service::requires_internal_load_balancer(svc);
        let svc_name = service::service_name(svc);
        let (desired_name, should_exist) = if !internal && want_lb {
            self.determine_public_ip_name(svc, ipv6).await?
        } else {
            (String::new(), false)
        };
        let ip_tag_request = requested_ip_tags(svc);

        let mut discovered = false;
        let mut deleted_desired = false;
        let mut to_update = Vec::new();
        let mut to_delete = Vec::new();
        for mut pip in pips {
            if want_lb && !internal && pip.name.eq_ignore_ascii_case(&desired_name) {
                discovered = true;
            }
            let (owns, user_assigned) = service_owns_public_ip(svc, &pip, self.cluster_name());
            if !owns {
                continue;
            }
            let mut dirty = false;
            if !want_lb || internal || !pip.name.eq_ignore_ascii_case(&desired_name) {
                unbind_service_from_pip(&mut pip, &svc_name, user_assigned);
                dirty = true;
            }
            if should_release_owned_public_ip(
                &pip,
                want_lb,
                internal,
                user_assigned,
                &desired_name,
                ip_tag_request.as_deref(),
            ) {
                if pip.name.eq_ignore_ascii_case(&desired_name) {
                    deleted_desired = true;
                }
                to_delete.push(pip);
            } else if dirty {
                to_update.push(pip);
            }
        }

        if !internal && should_exist && !discovered && want_lb {
            return Err(Error::not_found("PublicIPAddress", &desired_name));
        }

        futures::future::try_join_all(
            to_update
                .iter()
                .map(|pip| self.store.create_or_update_public_ip(rg, pip)),
        )
        .await?;
        for pip in &to_delete {
            self.safe_delete_public_ip(svc, rg, pip, lb.as_deref_mut())
                .await?;
        }

        if !internal && want_lb {
            let pip = self
                .ensure_public_ip_exists(
                    svc,
                    &desired_name,
                    should_exist && discovered && !deleted_desired,
                    ipv6,
                )
                .await?;
            return Ok(Some(pip));
        }
        Ok(None)
    }

    /// Detach the address from any frontend of `lb` still using it, then delete it.
    async fn safe_delete_public_ip(
        &self,
        svc: &Service,
        rg: &str,
        pip: &PublicIpAddress,
        lb: Option<&mut LoadBalancer>,
    ) -> Result<()> {
        let latest = self
            .store
            .get_public_ip(rg, &pip.name, CacheReadType::ForceRefresh)
            .await?;
        let Some(latest) = latest else {
            return Ok(());
        };
        if let (Some(binding), Some(lb)) = (latest.ip_configuration.as_ref(), lb) {
            let before = lb.frontend_ip_configurations.len();
            lb.frontend_ip_configurations
                .retain(|f| !binding.same_as(f.id()));
            if lb.frontend_ip_configurations.len() != before {
                lb.load_balancing_rules.retain(|r| {
                    !r.frontend_ip_configuration
                        .as_ref()
                        .is_some_and(|f| binding.same_as(&f.id))
                });
                warn!(
                    service = %service::service_name(svc),
                    pip = %pip.name,
                    lb = %lb.name,
                    "detaching public IP from frontend before deletion"
                );
                self.store.create_or_update_load_balancer(lb).await?;
                if let Some(fresh) = self
                    .store
                    .get_load_balancer(&lb.name, CacheReadType::Default)
                    .await?
                {
                    *lb = fresh;
                }
            }
        }
        info!(pip = %pip.name, "deleting public IP");
        self.store.delete_public_ip(rg, &pip.name).await
    }
}
