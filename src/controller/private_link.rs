//! Private link services in front of internal load balancer frontends.

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, instrument};

use super::annotations::{self, PLS_NAME};
use super::context::ReconcileContext;
use super::naming::FRONTEND_IP_CONFIG_NAME_MAX_LENGTH;
use super::public_ip::CLUSTER_NAME_KEY;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{
    FrontendIpConfiguration, IpAllocationMethod, IpVersion, PlsIpConfiguration, PrivateLinkService,
    SubResource,
};
use crate::config;
use crate::error::{Error, Result};

pub const OWNER_SERVICE_KEY: &str = "k8s-azure-owner-service";
pub const NETWORK_POLICIES_DISABLED: &str = "Disabled";
const PROVISIONING_STATE_FAILED: &str = "Failed";

/// The PLS carries this cluster's tag.
pub fn is_managed_private_link_service(pls: &PrivateLinkService, cluster_name: &str) -> bool {
    pls.tags
        .get(CLUSTER_NAME_KEY)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(cluster_name))
}

pub fn private_link_service_owner(pls: &PrivateLinkService) -> Option<&str> {
    pls.tags.get(OWNER_SERVICE_KEY).map(String::as_str)
}

/// Annotation name, which cannot rename an existing PLS; else the existing
/// name; else `pls-{frontend}`.
pub fn private_link_service_name(
    existing: Option<&PrivateLinkService>,
    svc: &Service,
    fip: &FrontendIpConfiguration,
) -> Result<String> {
    if let Some(wanted) = annotations::get(svc, PLS_NAME) {
        let wanted = wanted.trim();
        if let Some(existing) = existing {
            if !existing.name.eq_ignore_ascii_case(wanted) {
                return Err(Error::validation(format!(
                    "cannot change existing private link service name ({}) to ({wanted}) for service {}",
                    existing.name,
                    service::service_name(svc)
                )));
            }
        }
        return Ok(wanted.to_string());
    }
    match existing {
        Some(existing) => Ok(existing.name.clone()),
        None => Ok(format!("pls-{}", fip.name)),
    }
}

fn same_content(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

fn ip_config_name(subnet: &str, pls: &str, suffix: &str) -> Result<String> {
    let max_prefix = FRONTEND_IP_CONFIG_NAME_MAX_LENGTH
        .checked_sub(suffix.len())
        .filter(|n| *n > 0)
        .ok_or_else(|| Error::validation(format!("ip configuration suffix {suffix} is too long")))?;
    let mut prefix = format!("{subnet}-{pls}");
    prefix.truncate(max_prefix);
    Ok(prefix + suffix)
}

/// Rebuild the IP configurations when their count, subnet, static addresses
/// or primary address drift.
pub fn reconcile_ip_configurations(
    pls: &mut PrivateLinkService,
    svc: &Service,
    subnet_name: &str,
    subnet_id: &str,
) -> Result<bool> {
    let count = service::pls_ip_config_count(svc)?;
    let static_ips = service::pls_static_ips(svc)?;
    let count = usize::try_from(count).unwrap_or_default();
    if count < static_ips.len() {
        return Err(Error::validation(format!(
            "private link service ip configuration count ({count}) must be no smaller than the number of static IPs ({})",
            static_ips.len()
        )));
    }
    let primary_ip = static_ips.first().cloned();

    let mut changed = pls.ip_configurations.len() != count;
    let mut existing_static = 0;
    for config in &pls.ip_configurations {
        if !config.subnet.as_ref().is_some_and(|s| s.same_as(subnet_id)) {
            changed = true;
        }
        let is_static = config.private_ip_allocation_method == Some(IpAllocationMethod::Static);
        let address = config.private_ip_address.as_deref().unwrap_or_default();
        if is_static {
            existing_static += 1;
            if !static_ips.iter().any(|ip| ip == address) {
                changed = true;
            }
        }
        if config.primary == Some(true) {
            match (&primary_ip, is_static) {
                (Some(primary), true) if !primary.eq_ignore_ascii_case(address) => changed = true,
                (Some(_), false) => changed = true,
                _ => {}
            }
        }
    }
    if existing_static != static_ips.len() {
        changed = true;
    }
    if !changed {
        return Ok(false);
    }

    let mut configs = Vec::with_capacity(count);
    for ip in &static_ips {
        configs.push(PlsIpConfiguration {
            name: ip_config_name(subnet_name, &pls.name, &format!("-static-{ip}"))?,
            subnet: Some(SubResource::new(subnet_id)),
            private_ip_address: Some(ip.clone()),
            private_ip_allocation_method: Some(IpAllocationMethod::Static),
            private_ip_address_version: Some(IpVersion::IPv4),
            primary: Some(primary_ip.as_deref() == Some(ip.as_str())),
        });
    }
    for i in 0..count - static_ips.len() {
        configs.push(PlsIpConfiguration {
            name: ip_config_name(subnet_name, &pls.name, &format!("-dynamic-{i}"))?,
            subnet: Some(SubResource::new(subnet_id)),
            private_ip_address: None,
            private_ip_allocation_method: Some(IpAllocationMethod::Dynamic),
            private_ip_address_version: Some(IpVersion::IPv4),
            primary: Some(primary_ip.is_none() && i == 0),
        });
    }
    pls.ip_configurations = configs;
    Ok(true)
}

fn reconcile_proxy_protocol(pls: &mut PrivateLinkService, svc: &Service) -> bool {
    let wanted = service::pls_proxy_protocol_enabled(svc);
    if pls.enable_proxy_protocol.unwrap_or(false) == wanted {
        return false;
    }
    pls.enable_proxy_protocol = Some(wanted);
    true
}

fn reconcile_fqdns(pls: &mut PrivateLinkService, svc: &Service) -> bool {
    let wanted = service::pls_fqdns(svc);
    if same_content(&wanted, &pls.fqdns) {
        return false;
    }
    pls.fqdns = wanted;
    true
}

fn reconcile_visibility(pls: &mut PrivateLinkService, svc: &Service) -> bool {
    let visibility = service::pls_visibility(svc);
    let auto_approval = service::pls_auto_approval(svc);
    let differs = |current: &Option<Vec<String>>, wanted: &[String]| match current {
        Some(current) => !same_content(current, wanted),
        None => !wanted.is_empty(),
    };
    if !differs(&pls.visibility, &visibility) && !differs(&pls.auto_approval, &auto_approval) {
        return false;
    }
    pls.visibility = Some(visibility);
    pls.auto_approval = Some(auto_approval);
    true
}

impl ReconcileContext {
    fn reconcile_pls_tags(&self, pls: &mut PrivateLinkService, svc: &Service) -> bool {
        let mut wanted = self.config.parsed_tags();
        let cluster = pls
            .tags
            .get(CLUSTER_NAME_KEY)
            .cloned()
            .unwrap_or_else(|| self.cluster_name().to_string());
        let owner = pls
            .tags
            .get(OWNER_SERVICE_KEY)
            .cloned()
            .unwrap_or_else(|| service::service_name(svc));
        wanted.insert(CLUSTER_NAME_KEY.to_string(), cluster);
        wanted.insert(OWNER_SERVICE_KEY.to_string(), owner);
        config::reconcile_tags(&mut pls.tags, &wanted)
    }

    fn pls_subnet<'a>(&'a self, svc: &'a Service) -> &'a str {
        service::pls_subnet_name(svc).unwrap_or(self.config.subnet_name.as_str())
    }

    async fn disable_pls_network_policy(&self, svc: &Service) -> Result<()> {
        let name = self.pls_subnet(svc);
        let mut subnet = self
            .store
            .get_subnet(&self.config.vnet_name, name)
            .await?
            .ok_or_else(|| Error::not_found("Subnet", name))?;
        if subnet.private_link_service_network_policies.as_deref() == Some(NETWORK_POLICIES_DISABLED) {
            return Ok(());
        }
        info!(subnet = name, "disabling private link service network policies");
        subnet.private_link_service_network_policies = Some(NETWORK_POLICIES_DISABLED.to_string());
        self.store
            .create_or_update_subnet(&self.config.vnet_name, &subnet)
            .await
    }

    /// Fill `pls` with the settings the service asks for. Returns whether a
    /// write is needed.
    async fn expected_private_link_service(
        &self,
        pls: &mut PrivateLinkService,
        name: String,
        svc: &Service,
        fip: &FrontendIpConfiguration,
    ) -> Result<bool> {
        let mut dirty = false;
        if !pls.name.eq_ignore_ascii_case(&name) {
            pls.name = name;
            dirty = true;
        }
        if pls.provisioning_state.as_deref() == Some(PROVISIONING_STATE_FAILED) {
            dirty = true;
        }
        if pls.load_balancer_frontend_ip_configurations.is_empty() {
            pls.load_balancer_frontend_ip_configurations = vec![SubResource::new(fip.id())];
            dirty = true;
        }

        let subnet_name = self.pls_subnet(svc);
        let subnet = self
            .store
            .get_subnet(&self.config.vnet_name, subnet_name)
            .await?
            .ok_or_else(|| Error::not_found("Subnet", subnet_name))?;
        let subnet_id = subnet
            .id
            .clone()
            .unwrap_or_else(|| self.subnet_id(subnet_name));
        dirty |= reconcile_ip_configurations(pls, svc, &subnet.name, &subnet_id)?;
        dirty |= reconcile_proxy_protocol(pls, svc);
        dirty |= reconcile_fqdns(pls, svc);
        dirty |= reconcile_visibility(pls, svc);
        dirty |= self.reconcile_pls_tags(pls, svc);
        Ok(dirty)
    }

    /// Create, update or remove the private link service on one frontend.
    #[instrument(skip_all, fields(service = %service::service_name(svc), frontend = %fip.name, want_pls))]
    pub async fn reconcile_private_link_service(
        &self,
        svc: &Service,
        fip: &FrontendIpConfiguration,
        want_pls: bool,
    ) -> Result<()> {
        let svc_name = service::service_name(svc);
        let (_, _, version) = self.service_owns_frontend(fip, svc).await?;
        let ipv6 = match version {
            Some(v) => v.is_ipv6(),
            None => self.is_frontend_ipv6(svc, fip).await?,
        };
        let create = want_pls && service::requires_pls(svc);
        if ipv6 {
            if service::is_dual_stack(svc) || !create {
                debug!("private link service is not supported on IPv6, skipping");
                return Ok(());
            }
            return Err(Error::validation(format!(
                "IPv6 is not supported for private link service (service {svc_name})"
            )));
        }

        let rg = service::pls_resource_group(svc, &self.config);
        let existing = self
            .store
            .get_private_link_service_by_frontend(&rg, fip.id(), CacheReadType::Default)
            .await?;

        if !create {
            if !want_pls {
                if let Some(pls) = existing {
                    info!(pls = %pls.name, "deleting private link service");
                    self.store.delete_private_link_service(&rg, &pls).await?;
                }
            }
            return Ok(());
        }

        if !service::requires_internal_load_balancer(svc) && !service::is_floating_ip_disabled(svc) {
            return Err(Error::validation(format!(
                "service {svc_name} requires a private link service and must be internal or disable floating IP"
            )));
        }

        if let Some(pls) = &existing {
            if !is_managed_private_link_service(pls, self.cluster_name()) {
                return Err(Error::OwnershipConflict(format!(
                    "frontend {} already has unmanaged private link service {}",
                    fip.id(),
                    pls.id.as_deref().unwrap_or(&pls.name)
                )));
            }
            let owner = private_link_service_owner(pls).unwrap_or_default();
            if !owner.eq_ignore_ascii_case(&svc_name) {
                if service::has_additional_pls_configs(svc) {
                    return Err(Error::OwnershipConflict(format!(
                        "frontend {} already has private link service {} owned by service {owner}",
                        fip.id(),
                        pls.name
                    )));
                }
                debug!(pls = %pls.name, owner, "sharing private link service of another service");
                return Ok(());
            }
        }

        let name = private_link_service_name(existing.as_ref(), svc, fip)?;
        let mut pls = existing.unwrap_or_else(|| PrivateLinkService {
            location: Some(self.config.location.clone()),
            ..Default::default()
        });
        if self
            .expected_private_link_service(&mut pls, name, svc, fip)
            .await?
        {
            self.disable_pls_network_policy(svc).await?;
            pls.etag = None;
            info!(pls = %pls.name, "updating private link service");
            self.store
                .create_or_update_private_link_service(&rg, &pls)
                .await?;
        }
        Ok(())
    }
}
