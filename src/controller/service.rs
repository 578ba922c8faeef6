//! Read-only helpers over `Service` objects.
//!
//! A `Service` of type LoadBalancer plus its annotations is the whole desired
//! state of one reconciliation pass; nothing here talks to the cloud.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort};

use super::annotations::{self, *};
use crate::config::{
    CloudConfig, PRE_CONFIGURED_POOL_TYPES_ALL, PRE_CONFIGURED_POOL_TYPES_EXTERNAL,
    PRE_CONFIGURED_POOL_TYPES_INTERNAL,
};
use crate::error::{Error, Result};

pub const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";
pub const EXTERNAL_TRAFFIC_POLICY_LOCAL: &str = "Local";
pub const SESSION_AFFINITY_CLIENT_IP: &str = "ClientIP";
pub const PLS_MIN_IP_CONFIG_COUNT: i32 = 1;
pub const PLS_MAX_IP_CONFIG_COUNT: i32 = 8;

/// `namespace/name`, the identity stored in ownership tags.
pub fn service_name(svc: &Service) -> String {
    format!(
        "{}/{}",
        svc.metadata.namespace.as_deref().unwrap_or("default"),
        svc.metadata.name.as_deref().unwrap_or_default()
    )
}

pub fn is_load_balancer_service(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == SERVICE_TYPE_LOAD_BALANCER)
}

pub fn requires_internal_load_balancer(svc: &Service) -> bool {
    annotations::is_true(svc, LOAD_BALANCER_INTERNAL)
}

/// Subnet of an internal service, if it names one.
pub fn internal_subnet(svc: &Service) -> Option<&str> {
    if !requires_internal_load_balancer(svc) {
        return None;
    }
    annotations::get_non_empty(svc, LOAD_BALANCER_INTERNAL_SUBNET)
}

pub fn ports(svc: &Service) -> &[ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default()
}

/// `(ipv4, ipv6)` families requested by the service. An empty list means IPv4
/// unless the cluster IP is IPv6.
pub fn ip_families(svc: &Service) -> (bool, bool) {
    let spec = svc.spec.as_ref();
    let families = spec.and_then(|s| s.ip_families.as_deref()).unwrap_or_default();
    if families.is_empty() {
        let v6 = spec
            .and_then(|s| s.cluster_ip.as_deref())
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .is_some_and(|ip| ip.is_ipv6());
        return (!v6, v6);
    }
    (
        families.iter().any(|f| f == "IPv4"),
        families.iter().any(|f| f == "IPv6"),
    )
}

/// The families to reconcile, IPv4 first.
pub fn ipv6_flags(svc: &Service) -> Vec<bool> {
    let (v4, v6) = ip_families(svc);
    let mut out = Vec::with_capacity(2);
    if v4 {
        out.push(false);
    }
    if v6 {
        out.push(true);
    }
    out
}

pub fn is_dual_stack(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.ip_families.as_ref())
        .is_some_and(|f| f.len() == 2)
}

fn is_ipv4(ip: &str) -> bool {
    matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V4(_)))
}

/// Requested frontend address of one family: the per-family annotation, then
/// `spec.loadBalancerIP` when its family matches.
pub fn load_balancer_ip(svc: &Service, ipv6: bool) -> Option<String> {
    if let Some(ip) = annotations::get_non_empty(svc, load_balancer_ip_key(ipv6)) {
        return Some(ip.to_string());
    }
    let ip = svc.spec.as_ref()?.load_balancer_ip.as_deref()?.trim();
    if ip.is_empty() || is_ipv4(ip) == ipv6 {
        return None;
    }
    Some(ip.to_string())
}

pub fn load_balancer_ips(svc: &Service) -> Vec<String> {
    [false, true]
        .into_iter()
        .filter_map(|ipv6| load_balancer_ip(svc, ipv6))
        .collect()
}

/// Record an address in the annotation of its family.
pub fn set_load_balancer_ip(svc: &mut Service, ip: &str) {
    let key = load_balancer_ip_key(!is_ipv4(ip));
    svc.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), ip.to_string());
}

/// Copy of `svc` requesting the given addresses.
pub fn with_load_balancer_ips(svc: &Service, ips: &[String]) -> Service {
    let mut out = svc.clone();
    for ip in ips {
        set_load_balancer_ip(&mut out, ip);
    }
    out
}

/// Public IP name requested by annotation. Single-stack services always read
/// the base key.
pub fn pip_name(svc: &Service, ipv6: bool) -> Option<&str> {
    let key = if is_dual_stack(svc) {
        pip_name_key(ipv6)
    } else {
        PIP_NAME
    };
    annotations::get_non_empty(svc, key)
}

pub fn pip_names(svc: &Service) -> Vec<String> {
    [false, true]
        .into_iter()
        .filter_map(|ipv6| pip_name(svc, ipv6).map(str::to_string))
        .collect()
}

pub fn pip_prefix_id(svc: &Service, ipv6: bool) -> Option<&str> {
    let key = if is_dual_stack(svc) {
        pip_prefix_id_key(ipv6)
    } else {
        PIP_PREFIX_ID
    };
    annotations::get_non_empty(svc, key)
}

pub fn is_local_traffic(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.external_traffic_policy.as_deref())
        .is_some_and(|p| p == EXTERNAL_TRAFFIC_POLICY_LOCAL)
}

pub fn needs_health_check(svc: &Service) -> bool {
    is_load_balancer_service(svc) && is_local_traffic(svc)
}

pub fn health_check_node_port(svc: &Service) -> Option<i32> {
    svc.spec
        .as_ref()
        .and_then(|s| s.health_check_node_port)
        .filter(|p| *p > 0)
}

pub fn uses_client_ip_affinity(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.session_affinity.as_deref())
        .is_some_and(|a| a == SESSION_AFFINITY_CLIENT_IP)
}

pub fn uses_shared_security_rule(svc: &Service) -> bool {
    annotations::is_true(svc, SHARED_SECURITY_RULE)
}

pub fn is_floating_ip_disabled(svc: &Service) -> bool {
    annotations::is_true(svc, DISABLE_FLOATING_IP)
}

pub fn is_tcp_reset_disabled(svc: &Service) -> bool {
    annotations::is_true(svc, DISABLE_TCP_RESET)
}

/// Internal services on a standard load balancer may collapse every port into
/// one all-protocol rule.
pub fn is_ha_mode(svc: &Service, config: &CloudConfig) -> bool {
    config.use_standard_load_balancer()
        && requires_internal_load_balancer(svc)
        && annotations::is_true(svc, ENABLE_HIGH_AVAILABILITY_PORTS)
}

/// Copy of `svc` with the internal flag inverted.
pub fn flip_internal(svc: &Service) -> Service {
    let mut out = svc.clone();
    let annotations = out.metadata.annotations.get_or_insert_with(Default::default);
    if annotations.get(LOAD_BALANCER_INTERNAL).map(String::as_str) == Some(TRUE_VALUE) {
        annotations.remove(LOAD_BALANCER_INTERNAL);
    } else {
        annotations.insert(LOAD_BALANCER_INTERNAL.to_string(), TRUE_VALUE.to_string());
    }
    out
}

/// VM-set pinning requested through the mode annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerMode {
    pub specified: bool,
    pub auto: bool,
    pub vm_sets: Vec<String>,
}

pub fn load_balancer_mode(svc: &Service) -> LoadBalancerMode {
    let Some(raw) = annotations::get(svc, LOAD_BALANCER_MODE) else {
        return LoadBalancerMode::default();
    };
    let value = raw.trim();
    if value == LOAD_BALANCER_AUTO_MODE_VALUE {
        return LoadBalancerMode {
            specified: true,
            auto: true,
            vm_sets: Vec::new(),
        };
    }
    LoadBalancerMode {
        specified: true,
        auto: false,
        vm_sets: annotations::split_list(value),
    }
}

pub fn public_ip_resource_group(svc: &Service, config: &CloudConfig) -> String {
    annotations::get_non_empty(svc, LOAD_BALANCER_RESOURCE_GROUP)
        .unwrap_or(&config.resource_group)
        .to_string()
}

/// Whether the backend pools of this service's load balancer are managed outside
/// the reconciler.
pub fn is_backend_pool_preconfigured(svc: &Service, config: &CloudConfig) -> bool {
    let kind = config
        .pre_configured_backend_pool_load_balancer_types
        .to_ascii_lowercase();
    let internal = requires_internal_load_balancer(svc);
    kind == PRE_CONFIGURED_POOL_TYPES_ALL
        || (kind == PRE_CONFIGURED_POOL_TYPES_INTERNAL && internal)
        || (kind == PRE_CONFIGURED_POOL_TYPES_EXTERNAL && !internal)
}

/// Addresses listed in the additional public IPs annotation.
pub fn additional_public_ips(svc: &Service) -> Result<Vec<String>> {
    let Some(raw) = annotations::get(svc, ADDITIONAL_PUBLIC_IPS) else {
        return Ok(Vec::new());
    };
    annotations::split_list(raw)
        .into_iter()
        .map(|ip| {
            ip.parse::<IpAddr>().map(|_| ip.clone()).map_err(|_| {
                Error::validation(format!(
                    "{ADDITIONAL_PUBLIC_IPS} contains an invalid address {ip:?}"
                ))
            })
        })
        .collect()
}

// Private link

pub fn requires_pls(svc: &Service) -> bool {
    annotations::is_enabled(svc, PLS_CREATION)
}

pub fn pls_proxy_protocol_enabled(svc: &Service) -> bool {
    annotations::is_enabled(svc, PLS_PROXY_PROTOCOL)
}

/// Subnet for the PLS NICs: its own annotation, then the internal LB subnet.
pub fn pls_subnet_name(svc: &Service) -> Option<&str> {
    annotations::get_non_empty(svc, PLS_IP_CONFIGURATION_SUBNET).or_else(|| internal_subnet(svc))
}

pub fn pls_ip_config_count(svc: &Service) -> Result<i32> {
    let count = annotations::get_i32(svc, PLS_IP_CONFIGURATION_IP_ADDRESS_COUNT)?
        .unwrap_or(PLS_MIN_IP_CONFIG_COUNT);
    if !(PLS_MIN_IP_CONFIG_COUNT..=PLS_MAX_IP_CONFIG_COUNT).contains(&count) {
        return Err(Error::validation(format!(
            "{PLS_IP_CONFIGURATION_IP_ADDRESS_COUNT} must be between {PLS_MIN_IP_CONFIG_COUNT} and {PLS_MAX_IP_CONFIG_COUNT}, got {count}"
        )));
    }
    Ok(count)
}

pub fn pls_fqdns(svc: &Service) -> Vec<String> {
    annotations::get(svc, PLS_FQDNS)
        .map(annotations::split_fields)
        .unwrap_or_default()
}

/// Subscriptions allowed to see the PLS. `*` anywhere means everybody.
pub fn pls_visibility(svc: &Service) -> Vec<String> {
    let values = annotations::get(svc, PLS_VISIBILITY)
        .map(annotations::split_fields)
        .unwrap_or_default();
    if values.iter().any(|v| v == "*") {
        return vec!["*".to_string()];
    }
    values
}

pub fn pls_auto_approval(svc: &Service) -> Vec<String> {
    annotations::get(svc, PLS_AUTO_APPROVAL)
        .map(annotations::split_fields)
        .unwrap_or_default()
}

/// Static PLS addresses. Only IPv4 is accepted.
pub fn pls_static_ips(svc: &Service) -> Result<Vec<String>> {
    let values = annotations::get(svc, PLS_IP_CONFIGURATION_IP_ADDRESS)
        .map(annotations::split_fields)
        .unwrap_or_default();
    for ip in &values {
        if !is_ipv4(ip) {
            return Err(Error::validation(format!(
                "{PLS_IP_CONFIGURATION_IP_ADDRESS} must list IPv4 addresses, got {ip:?}"
            )));
        }
    }
    Ok(values)
}

/// Any private link setting beyond the creation switch and resource group.
pub fn has_additional_pls_configs(svc: &Service) -> bool {
    PLS_SETTINGS.iter().any(|key| annotations::has(svc, key))
}

pub fn pls_resource_group(svc: &Service, config: &CloudConfig) -> String {
    annotations::get_non_empty(svc, PLS_RESOURCE_GROUP)
        .unwrap_or_else(|| config.private_link_service_resource_group())
        .to_string()
}
