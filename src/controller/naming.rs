//! Deterministic names and resource IDs.
//!
//! Ownership of rules, probes, frontends and security rules is decided by name
//! across independent passes, so every function here must stay stable.

use k8s_openapi::api::core::v1::{Service, ServicePort};

use crate::cloud::types::SecurityRule;
use crate::error::{Error, Result};

use super::service;

pub const INTERNAL_LOAD_BALANCER_NAME_SUFFIX: &str = "-internal";
pub const IPV6_SUFFIX: &str = "-IPv6";
pub const SHARED_PROBE_NAME: &str = "cluster-service-shared-health-probe";
pub const SHARED_SECURITY_RULE_PREFIX: &str = "shared";
pub const DEFAULT_LOAD_BALANCER_SOURCE_RANGE: &str = "0.0.0.0/0";

pub const LOAD_BALANCER_RULE_NAME_MAX_LENGTH: usize = 80;
pub const FRONTEND_IP_CONFIG_NAME_MAX_LENGTH: usize = 80;
pub const PUBLIC_IP_NAME_MAX_LENGTH: usize = 80;
pub const IP_FAMILY_SUFFIX_LENGTH: usize = 5;

pub const SECURITY_RULE_MINIMUM_PRIORITY: i32 = 500;
pub const SECURITY_RULE_MAXIMUM_PRIORITY: i32 = 4096;

const DEFAULT_LOAD_BALANCER_NAME_LENGTH: usize = 32;
const ROUTE_NAME_SEPARATOR: &str = "____";

/// `a` followed by the service UID without dashes, at most 32 characters.
/// Used both as the primary frontend name and as the rule prefix.
pub fn rule_prefix(svc: &Service) -> String {
    let uid = svc.metadata.uid.as_deref().unwrap_or_default().replace('-', "");
    let mut name = format!("a{uid}");
    name.truncate(DEFAULT_LOAD_BALANCER_NAME_LENGTH);
    name
}

/// Append `-IPv6` to resources of the IPv6 family of a dual-stack service.
pub fn resource_by_ip_family(name: &str, dual_stack: bool, ipv6: bool) -> String {
    if dual_stack && ipv6 {
        format!("{name}{IPV6_SUFFIX}")
    } else {
        name.to_string()
    }
}

pub fn has_ipv6_suffix(name: &str) -> bool {
    name.to_ascii_lowercase()
        .ends_with(&IPV6_SUFFIX.to_ascii_lowercase())
}

/// `{prefix}-{PROTO}-{port}`, or `{prefix}-{subnet}-{PROTO}-{port}` for services
/// on an internal subnet, with the subnet segment shortened to fit 75 characters.
pub fn load_balancer_rule_name(svc: &Service, protocol: &str, port: i32, ipv6: bool) -> String {
    let prefix = rule_prefix(svc);
    let rule_name = format!("{prefix}-{protocol}-{port}");
    let dual_stack = service::is_dual_stack(svc);
    let Some(subnet) = service::internal_subnet(svc) else {
        return resource_by_ip_family(&rule_name, dual_stack, ipv6);
    };

    let max_length = LOAD_BALANCER_RULE_NAME_MAX_LENGTH - IP_FAMILY_SUFFIX_LENGTH;
    let mut segment = subnet.to_string();
    if rule_name.len() + segment.len() + 1 > max_length {
        segment.truncate(max_length.saturating_sub(rule_name.len() + 1));
    }
    resource_by_ip_family(
        &format!("{prefix}-{segment}-{protocol}-{port}"),
        dual_stack,
        ipv6,
    )
}

/// HA-ports rules are named after the first declared port.
pub fn ha_mode_rule_name(svc: &Service, ipv6: bool) -> Option<String> {
    let port = service::ports(svc).first()?;
    Some(load_balancer_rule_name(
        svc,
        port.protocol.as_deref().unwrap_or("TCP"),
        port.port,
        ipv6,
    ))
}

pub fn security_rule_name(svc: &Service, port: &ServicePort, source: &str, ipv6: bool) -> String {
    let safe = source.replace('/', "_").replace(':', ".");
    let protocol = port.protocol.as_deref().unwrap_or("TCP");
    let name = if service::uses_shared_security_rule(svc) {
        format!(
            "{SHARED_SECURITY_RULE_PREFIX}-{protocol}-{}-{safe}",
            port.port
        )
    } else {
        format!("{}-{protocol}-{}-{safe}", rule_prefix(svc), port.port)
    };
    resource_by_ip_family(&name, service::is_dual_stack(svc), ipv6)
}

/// `{cluster}-{prefix}`, suffixed with the public IP prefix name when one is requested.
pub fn public_ip_name(cluster_name: &str, svc: &Service, ipv6: bool) -> String {
    let mut name = format!("{cluster_name}-{}", rule_prefix(svc));
    if let Some(prefix_id) = service::pip_prefix_id(svc, ipv6) {
        if let Ok(segment) = last_segment(prefix_id) {
            name = format!("{name}-{segment}");
        }
    }
    name.truncate(PUBLIC_IP_NAME_MAX_LENGTH - IP_FAMILY_SUFFIX_LENGTH);
    resource_by_ip_family(&name, service::is_dual_stack(svc), ipv6)
}

/// Frontend name of the primary service before the IP family suffix.
pub fn default_frontend_ip_config_name(svc: &Service) -> String {
    let base = rule_prefix(svc);
    let Some(subnet) = service::internal_subnet(svc) else {
        return base;
    };
    let mut name = format!("{base}-{subnet}");
    let max_length = FRONTEND_IP_CONFIG_NAME_MAX_LENGTH - IP_FAMILY_SUFFIX_LENGTH;
    if name.len() > max_length {
        name.truncate(max_length);
        // A cut can leave a trailing '-' which the API rejects.
        if let Some(last) = name.chars().last() {
            if !last.is_alphabetic() && last != '_' {
                name.pop();
                name.push('_');
            }
        }
    }
    name
}

pub fn frontend_ip_config_name(svc: &Service, ipv6: bool) -> String {
    resource_by_ip_family(
        &default_frontend_ip_config_name(svc),
        service::is_dual_stack(svc),
        ipv6,
    )
}

/// `{cluster}` for IPv4, `{cluster}-IPv6` for IPv6.
pub fn backend_pool_name(cluster_name: &str, ipv6: bool) -> String {
    if ipv6 {
        format!("{cluster_name}{IPV6_SUFFIX}")
    } else {
        cluster_name.to_string()
    }
}

pub fn is_backend_pool_ipv6(name: &str) -> bool {
    has_ipv6_suffix(name)
}

pub fn trim_internal_suffix(lb_name: &str) -> &str {
    let suffix_len = INTERNAL_LOAD_BALANCER_NAME_SUFFIX.len();
    if lb_name.len() >= suffix_len
        && lb_name[lb_name.len() - suffix_len..]
            .eq_ignore_ascii_case(INTERNAL_LOAD_BALANCER_NAME_SUFFIX)
    {
        &lb_name[..lb_name.len() - suffix_len]
    } else {
        lb_name
    }
}

/// Last `/`-separated segment of a resource ID.
pub fn last_segment(id: &str) -> Result<&str> {
    match id.rsplit('/').next() {
        Some(segment) if !segment.is_empty() => Ok(segment),
        _ => Err(Error::validation(format!(
            "resource name was missing from identifier {id:?}"
        ))),
    }
}

fn network_id(subscription_id: &str, resource_group: &str, kind: &str, name: &str) -> String {
    format!(
        "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.Network/{kind}/{name}"
    )
}

pub fn load_balancer_id(subscription_id: &str, resource_group: &str, name: &str) -> String {
    network_id(subscription_id, resource_group, "loadBalancers", name)
}

pub fn frontend_ip_config_id(
    subscription_id: &str,
    resource_group: &str,
    lb_name: &str,
    name: &str,
) -> String {
    format!(
        "{}/frontendIPConfigurations/{name}",
        load_balancer_id(subscription_id, resource_group, lb_name)
    )
}

pub fn backend_pool_id(
    subscription_id: &str,
    resource_group: &str,
    lb_name: &str,
    name: &str,
) -> String {
    format!(
        "{}/backendAddressPools/{name}",
        load_balancer_id(subscription_id, resource_group, lb_name)
    )
}

pub fn probe_id(subscription_id: &str, resource_group: &str, lb_name: &str, name: &str) -> String {
    format!(
        "{}/probes/{name}",
        load_balancer_id(subscription_id, resource_group, lb_name)
    )
}

pub fn public_ip_id(subscription_id: &str, resource_group: &str, name: &str) -> String {
    network_id(subscription_id, resource_group, "publicIPAddresses", name)
}

pub fn subnet_id(subscription_id: &str, resource_group: &str, vnet: &str, subnet: &str) -> String {
    format!(
        "{}/subnets/{subnet}",
        network_id(subscription_id, resource_group, "virtualNetworks", vnet)
    )
}

pub fn private_link_service_id(subscription_id: &str, resource_group: &str, name: &str) -> String {
    network_id(subscription_id, resource_group, "privateLinkServices", name)
}

/// Route names are the node name, or `{node}____{cidr}` with separators
/// stripped when the cluster is dual-stack.
pub fn route_name(node_name: &str, cidr: &str, dual_stack: bool) -> String {
    if !dual_stack {
        return node_name.to_string();
    }
    let cidr: String = cidr
        .chars()
        .filter(|c| !matches!(c, ':' | '.' | '/'))
        .collect();
    format!("{node_name}{ROUTE_NAME_SEPARATOR}{cidr}")
}

pub fn node_name_from_route(route_name: &str) -> &str {
    route_name
        .split_once(ROUTE_NAME_SEPARATOR)
        .map(|(node, _)| node)
        .unwrap_or(route_name)
}

/// Lowest unused priority in `500..4096`.
pub fn next_available_priority(rules: &[SecurityRule]) -> Result<i32> {
    (SECURITY_RULE_MINIMUM_PRIORITY..SECURITY_RULE_MAXIMUM_PRIORITY)
        .find(|p| !rules.iter().any(|r| r.priority == *p))
        .ok_or_else(|| Error::validation("security group priorities are exhausted"))
}
