//! Service annotation keys and parsers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

use crate::error::{Error, Result};

pub const TRUE_VALUE: &str = "true";

pub const LOAD_BALANCER_INTERNAL: &str = "service.beta.kubernetes.io/azure-load-balancer-internal";
pub const LOAD_BALANCER_INTERNAL_SUBNET: &str =
    "service.beta.kubernetes.io/azure-load-balancer-internal-subnet";
pub const LOAD_BALANCER_MODE: &str = "service.beta.kubernetes.io/azure-load-balancer-mode";
pub const LOAD_BALANCER_AUTO_MODE_VALUE: &str = "__auto__";
pub const LOAD_BALANCER_RESOURCE_GROUP: &str =
    "service.beta.kubernetes.io/azure-load-balancer-resource-group";
pub const DNS_LABEL_NAME: &str = "service.beta.kubernetes.io/azure-dns-label-name";
pub const SHARED_SECURITY_RULE: &str = "service.beta.kubernetes.io/azure-shared-securityrule";
pub const PIP_IP_TAGS: &str = "service.beta.kubernetes.io/azure-pip-ip-tags";
pub const PIP_TAGS: &str = "service.beta.kubernetes.io/azure-pip-tags";
pub const ALLOWED_SERVICE_TAGS: &str = "service.beta.kubernetes.io/azure-allowed-service-tags";
pub const ALLOWED_IP_RANGES: &str = "service.beta.kubernetes.io/azure-allowed-ip-ranges";
pub const DENY_ALL_EXCEPT_LOAD_BALANCER_SOURCE_RANGES: &str =
    "service.beta.kubernetes.io/azure-deny-all-except-load-balancer-source-ranges";
pub const LOAD_BALANCER_IDLE_TIMEOUT: &str =
    "service.beta.kubernetes.io/azure-load-balancer-tcp-idle-timeout";
pub const ENABLE_HIGH_AVAILABILITY_PORTS: &str =
    "service.beta.kubernetes.io/azure-load-balancer-enable-high-availability-ports";
pub const HEALTH_PROBE_PROTOCOL: &str =
    "service.beta.kubernetes.io/azure-load-balancer-health-probe-protocol";
pub const HEALTH_PROBE_INTERVAL: &str =
    "service.beta.kubernetes.io/azure-load-balancer-health-probe-interval";
pub const HEALTH_PROBE_NUM_OF_PROBE: &str =
    "service.beta.kubernetes.io/azure-load-balancer-health-probe-num-of-probe";
pub const HEALTH_PROBE_REQUEST_PATH: &str =
    "service.beta.kubernetes.io/azure-load-balancer-health-probe-request-path";
pub const DISABLE_FLOATING_IP: &str =
    "service.beta.kubernetes.io/azure-disable-load-balancer-floating-ip";
pub const ADDITIONAL_PUBLIC_IPS: &str = "service.beta.kubernetes.io/azure-additional-public-ips";
pub const LOAD_BALANCER_CONFIGURATIONS: &str =
    "service.beta.kubernetes.io/azure-load-balancer-configurations";
pub const DISABLE_TCP_RESET: &str =
    "service.beta.kubernetes.io/azure-load-balancer-disable-tcp-reset";

pub const LOAD_BALANCER_IPV4: &str = "service.beta.kubernetes.io/azure-load-balancer-ipv4";
pub const LOAD_BALANCER_IPV6: &str = "service.beta.kubernetes.io/azure-load-balancer-ipv6";
pub const PIP_NAME: &str = "service.beta.kubernetes.io/azure-pip-name";
pub const PIP_NAME_IPV6: &str = "service.beta.kubernetes.io/azure-pip-name-ipv6";
pub const PIP_PREFIX_ID: &str = "service.beta.kubernetes.io/azure-pip-prefix-id";
pub const PIP_PREFIX_ID_IPV6: &str = "service.beta.kubernetes.io/azure-pip-prefix-id-ipv6";

pub const PLS_CREATION: &str = "service.beta.kubernetes.io/azure-pls-create";
pub const PLS_RESOURCE_GROUP: &str = "service.beta.kubernetes.io/azure-pls-resource-group";
pub const PLS_NAME: &str = "service.beta.kubernetes.io/azure-pls-name";
pub const PLS_IP_CONFIGURATION_SUBNET: &str =
    "service.beta.kubernetes.io/azure-pls-ip-configuration-subnet";
pub const PLS_IP_CONFIGURATION_IP_ADDRESS_COUNT: &str =
    "service.beta.kubernetes.io/azure-pls-ip-configuration-ip-address-count";
pub const PLS_IP_CONFIGURATION_IP_ADDRESS: &str =
    "service.beta.kubernetes.io/azure-pls-ip-configuration-ip-address";
pub const PLS_FQDNS: &str = "service.beta.kubernetes.io/azure-pls-fqdns";
pub const PLS_PROXY_PROTOCOL: &str = "service.beta.kubernetes.io/azure-pls-proxy-protocol";
pub const PLS_VISIBILITY: &str = "service.beta.kubernetes.io/azure-pls-visibility";
pub const PLS_AUTO_APPROVAL: &str = "service.beta.kubernetes.io/azure-pls-auto-approval";

/// Private link annotations that configure the resource itself.
pub const PLS_SETTINGS: [&str; 8] = [
    PLS_NAME,
    PLS_IP_CONFIGURATION_SUBNET,
    PLS_IP_CONFIGURATION_IP_ADDRESS_COUNT,
    PLS_IP_CONFIGURATION_IP_ADDRESS,
    PLS_FQDNS,
    PLS_PROXY_PROTOCOL,
    PLS_VISIBILITY,
    PLS_AUTO_APPROVAL,
];

pub const PORT_NO_LB_RULE: &str = "no_lb_rule";
pub const PORT_NO_PROBE_RULE: &str = "no_probe_rule";

pub const PROBE_PARAM_PROTOCOL: &str = "protocol";
pub const PROBE_PARAM_PORT: &str = "port";
pub const PROBE_PARAM_INTERVAL: &str = "interval";
pub const PROBE_PARAM_NUM_OF_PROBE: &str = "num-of-probe";
pub const PROBE_PARAM_REQUEST_PATH: &str = "request-path";

pub const DEFAULT_PROBE_INTERVAL: i32 = 5;
pub const DEFAULT_NUM_OF_PROBE: i32 = 2;
pub const DEFAULT_PROBE_REQUEST_PATH: &str = "/";
pub const MAX_PROBE_DURATION_SECONDS: i32 = 120;

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: i32 = 4;

pub fn load_balancer_ip_key(ipv6: bool) -> &'static str {
    if ipv6 {
        LOAD_BALANCER_IPV6
    } else {
        LOAD_BALANCER_IPV4
    }
}

pub fn pip_name_key(ipv6: bool) -> &'static str {
    if ipv6 {
        PIP_NAME_IPV6
    } else {
        PIP_NAME
    }
}

pub fn pip_prefix_id_key(ipv6: bool) -> &'static str {
    if ipv6 {
        PIP_PREFIX_ID_IPV6
    } else {
        PIP_PREFIX_ID
    }
}

/// `service.beta.kubernetes.io/port_{port}_{param}`
pub fn port_key(port: i32, param: &str) -> String {
    format!("service.beta.kubernetes.io/port_{port}_{param}")
}

/// `service.beta.kubernetes.io/port_{port}_health-probe_{param}`
pub fn health_probe_port_key(port: i32, param: &str) -> String {
    port_key(port, &format!("health-probe_{param}"))
}

/// Global annotation backing a per-port probe parameter, if any.
fn health_probe_global_key(param: &str) -> Option<&'static str> {
    match param {
        PROBE_PARAM_PROTOCOL => Some(HEALTH_PROBE_PROTOCOL),
        PROBE_PARAM_INTERVAL => Some(HEALTH_PROBE_INTERVAL),
        PROBE_PARAM_NUM_OF_PROBE => Some(HEALTH_PROBE_NUM_OF_PROBE),
        PROBE_PARAM_REQUEST_PATH => Some(HEALTH_PROBE_REQUEST_PATH),
        _ => None,
    }
}

pub fn get<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn has(svc: &Service, key: &str) -> bool {
    get(svc, key).is_some()
}

/// Trimmed, non-empty value.
pub fn get_non_empty<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    get(svc, key).map(str::trim).filter(|v| !v.is_empty())
}

/// Only the exact value `true` enables a flag.
pub fn is_true(svc: &Service, key: &str) -> bool {
    get(svc, key) == Some(TRUE_VALUE)
}

/// Case-insensitive `true`, used by the private link switches.
pub fn is_enabled(svc: &Service, key: &str) -> bool {
    get(svc, key)
        .map(|v| v.trim().eq_ignore_ascii_case(TRUE_VALUE))
        .unwrap_or(false)
}

/// Parse an integer annotation, `Ok(None)` when absent.
pub fn get_i32(svc: &Service, key: &str) -> Result<Option<i32>> {
    let Some(raw) = get(svc, key) else {
        return Ok(None);
    };
    raw.trim().parse::<i32>().map(Some).map_err(|_| {
        Error::validation(format!("annotation {key}={raw:?} is not a valid integer"))
    })
}

pub fn is_port_rule_disabled(svc: &Service, port: i32) -> bool {
    is_true(svc, &port_key(port, PORT_NO_LB_RULE))
}

pub fn is_port_probe_disabled(svc: &Service, port: i32) -> bool {
    is_true(svc, &port_key(port, PORT_NO_PROBE_RULE))
}

/// Per-port probe setting, falling back to the service-wide annotation.
pub fn health_probe_value<'a>(svc: &'a Service, port: i32, param: &str) -> Option<&'a str> {
    get(svc, &health_probe_port_key(port, param))
        .or_else(|| health_probe_global_key(param).and_then(|k| get(svc, k)))
}

pub fn health_probe_i32(svc: &Service, port: i32, param: &str) -> Result<Option<i32>> {
    let per_port = health_probe_port_key(port, param);
    if has(svc, &per_port) {
        return get_i32(svc, &per_port);
    }
    match health_probe_global_key(param) {
        Some(key) => get_i32(svc, key),
        None => Ok(None),
    }
}

/// Probe interval in seconds; at least 5.
pub fn health_probe_interval(svc: &Service, port: i32) -> Result<i32> {
    let interval = health_probe_i32(svc, port, PROBE_PARAM_INTERVAL)?
        .unwrap_or(DEFAULT_PROBE_INTERVAL);
    if interval < DEFAULT_PROBE_INTERVAL {
        return Err(Error::validation(format!(
            "health probe interval of port {port} must be at least {DEFAULT_PROBE_INTERVAL}, got {interval}"
        )));
    }
    Ok(interval)
}

/// Consecutive probe failures before a backend is taken out; at least 1.
pub fn health_probe_num_of_probe(svc: &Service, port: i32) -> Result<i32> {
    let num = health_probe_i32(svc, port, PROBE_PARAM_NUM_OF_PROBE)?
        .unwrap_or(DEFAULT_NUM_OF_PROBE);
    if num < 1 {
        return Err(Error::validation(format!(
            "health probe num-of-probe of port {port} must be positive, got {num}"
        )));
    }
    Ok(num)
}

/// TCP idle timeout in minutes, bounded to `4..=100`.
pub fn idle_timeout(svc: &Service) -> Result<Option<i32>> {
    let Some(minutes) = get_i32(svc, LOAD_BALANCER_IDLE_TIMEOUT)? else {
        return Ok(None);
    };
    if !(4..=100).contains(&minutes) {
        return Err(Error::validation(format!(
            "idle timeout value must be a whole number representing minutes between 4 and 100, got {minutes}"
        )));
    }
    Ok(Some(minutes))
}

/// Comma separated, trimmed, lowercase load balancer configuration names.
pub fn load_balancer_configuration_names(svc: &Service) -> Vec<String> {
    split_list(get(svc, LOAD_BALANCER_CONFIGURATIONS).unwrap_or_default())
        .into_iter()
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whitespace separated list, used by the private link annotations.
pub fn split_fields(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// `type=tag,type2=tag2` from the IP tags annotation. `None` when the annotation is absent.
pub fn ip_tags(svc: &Service) -> Option<BTreeMap<String, String>> {
    let raw = get(svc, PIP_IP_TAGS)?;
    Some(parse_key_values(raw))
}

/// Extra tags requested for public IPs.
pub fn pip_tags(svc: &Service) -> BTreeMap<String, String> {
    get(svc, PIP_TAGS).map(parse_key_values).unwrap_or_default()
}

fn parse_key_values(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect()
}
