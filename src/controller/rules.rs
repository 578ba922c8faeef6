//! Expected load balancing rules and probes of a service.
//!
//! Derivation is pure: the same service, configuration and target always yield
//! the same rules and probes, in service port order.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::{debug, warn};

use super::annotations::{
    self, DEFAULT_PROBE_REQUEST_PATH, MAX_PROBE_DURATION_SECONDS, PROBE_PARAM_INTERVAL,
    PROBE_PARAM_NUM_OF_PROBE, PROBE_PARAM_PORT, PROBE_PARAM_PROTOCOL, PROBE_PARAM_REQUEST_PATH,
};
use super::naming;
use super::service;
use crate::cloud::types::{
    LoadBalancingRule, LoadDistribution, Probe, ProbeProtocol, SubResource, TransportProtocol,
};
use crate::config::CloudConfig;
use crate::error::{Error, Result};

pub const PROTOCOL_TCP: &str = "TCP";
pub const PROTOCOL_UDP: &str = "UDP";
pub const PROTOCOL_SCTP: &str = "SCTP";

/// Path served by the node health check proxy for local traffic services.
pub const POD_PRESENCE_PATH: &str = "/healthz";

/// Where the generated rules point.
#[derive(Clone, Debug)]
pub struct RuleTarget<'a> {
    pub lb_name: &'a str,
    pub frontend_ip_config_id: &'a str,
    pub backend_pool_id: &'a str,
    pub ipv6: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpectedRules {
    pub probes: Vec<Probe>,
    pub rules: Vec<LoadBalancingRule>,
}

pub fn port_protocol(port: &ServicePort) -> &str {
    port.protocol.as_deref().unwrap_or(PROTOCOL_TCP)
}

pub fn transport_protocol(protocol: &str) -> Result<TransportProtocol> {
    match protocol.to_ascii_uppercase().as_str() {
        PROTOCOL_TCP => Ok(TransportProtocol::Tcp),
        PROTOCOL_UDP => Ok(TransportProtocol::Udp),
        // SCTP has no dedicated transport on the load balancer.
        PROTOCOL_SCTP => Ok(TransportProtocol::All),
        other => Err(Error::validation(format!(
            "unsupported service port protocol {other:?}"
        ))),
    }
}

/// The probe every non-local service shares when the cluster runs in shared probe mode.
pub fn cluster_service_shared_probe(config: &CloudConfig) -> Probe {
    Probe {
        name: naming::SHARED_PROBE_NAME.to_string(),
        id: None,
        protocol: ProbeProtocol::Http,
        port: config.cluster_service_shared_load_balancer_health_probe_port,
        request_path: Some(
            config
                .cluster_service_shared_load_balancer_health_probe_path
                .clone(),
        ),
        interval_in_seconds: Some(annotations::DEFAULT_PROBE_INTERVAL),
        number_of_probes: Some(annotations::DEFAULT_NUM_OF_PROBE),
    }
}

/// Interval and threshold for probes of `port`; their product must stay under two minutes.
pub fn probe_interval_and_count(svc: &Service, port: i32) -> Result<(i32, i32)> {
    let interval = annotations::health_probe_interval(svc, port)?;
    let count = annotations::health_probe_num_of_probe(svc, port)?;
    if interval.saturating_mul(count) >= MAX_PROBE_DURATION_SECONDS {
        return Err(Error::validation(format!(
            "total probe duration of port {port} ({interval}s x {count}) must be less than {MAX_PROBE_DURATION_SECONDS}s"
        )));
    }
    Ok((interval, count))
}

fn has_port_probe_override(svc: &Service, port: i32) -> bool {
    [
        PROBE_PARAM_PROTOCOL,
        PROBE_PARAM_PORT,
        PROBE_PARAM_INTERVAL,
        PROBE_PARAM_NUM_OF_PROBE,
        PROBE_PARAM_REQUEST_PATH,
    ]
    .iter()
    .any(|param| annotations::has(svc, &annotations::health_probe_port_key(port, param)))
}

/// Resolve the probe port override: a port number, which maps to its node port
/// when it names a service port, or a service port name.
fn probe_port_override(svc: &Service, port: i32) -> Result<Option<i32>> {
    let key = annotations::health_probe_port_key(port, PROBE_PARAM_PORT);
    let Some(raw) = annotations::get_non_empty(svc, &key) else {
        return Ok(None);
    };
    let ports = service::ports(svc);
    if let Ok(number) = raw.parse::<i32>() {
        let node_port = ports
            .iter()
            .find(|p| p.port == number)
            .and_then(|p| p.node_port);
        return Ok(Some(node_port.unwrap_or(number)));
    }
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(raw))
        .and_then(|p| p.node_port)
        .map(Some)
        .ok_or_else(|| {
            Error::validation(format!(
                "annotation {key}={raw:?} names neither a port number nor a service port"
            ))
        })
}

/// Probe for one service port. `None` when the port needs no dedicated probe:
/// UDP and SCTP ports, the shared probe mode, or a local traffic service
/// without a per-port override.
pub fn port_probe(
    config: &CloudConfig,
    svc: &Service,
    port: &ServicePort,
    rule_name: &str,
    node_endpoint_probe: Option<&Probe>,
    use_shared_probe: bool,
) -> Result<Option<Probe>> {
    if use_shared_probe {
        return Ok(None);
    }
    let protocol = port_protocol(port);
    if protocol.eq_ignore_ascii_case(PROTOCOL_UDP) || protocol.eq_ignore_ascii_case(PROTOCOL_SCTP)
    {
        return Ok(None);
    }
    if node_endpoint_probe.is_some() && !has_port_probe_override(svc, port.port) {
        return Ok(None);
    }

    let requested = annotations::get_non_empty(
        svc,
        &annotations::health_probe_port_key(port.port, PROBE_PARAM_PROTOCOL),
    )
    .or(port.app_protocol.as_deref())
    .or_else(|| annotations::get_non_empty(svc, annotations::HEALTH_PROBE_PROTOCOL))
    .unwrap_or(PROTOCOL_TCP);
    let probe_protocol = match ProbeProtocol::parse(requested) {
        // HTTPS probes need a standard load balancer.
        Some(ProbeProtocol::Https) if !config.use_standard_load_balancer() => ProbeProtocol::Tcp,
        Some(p) => p,
        None => ProbeProtocol::Tcp,
    };

    let probe_port = match probe_port_override(svc, port.port)? {
        Some(p) => p,
        None => port.node_port.unwrap_or(port.port),
    };

    let request_path = match probe_protocol {
        ProbeProtocol::Tcp => None,
        ProbeProtocol::Http | ProbeProtocol::Https => Some(
            annotations::health_probe_value(svc, port.port, PROBE_PARAM_REQUEST_PATH)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_PROBE_REQUEST_PATH)
                .to_string(),
        ),
    };

    let (interval, count) = probe_interval_and_count(svc, port.port)?;
    Ok(Some(Probe {
        name: rule_name.to_string(),
        id: None,
        protocol: probe_protocol,
        port: probe_port,
        request_path,
        interval_in_seconds: Some(interval),
        number_of_probes: Some(count),
    }))
}

/// HTTP probe against the node health check port of a local traffic service.
fn node_endpoint_probe(svc: &Service, ipv6: bool) -> Result<Option<Probe>> {
    if !service::needs_health_check(svc)
        || (service::requires_pls(svc) && service::pls_proxy_protocol_enabled(svc))
    {
        return Ok(None);
    }
    let Some(port) = service::health_check_node_port(svc) else {
        return Ok(None);
    };
    let (interval, count) = probe_interval_and_count(svc, port)?;
    Ok(Some(Probe {
        name: naming::load_balancer_rule_name(svc, PROTOCOL_TCP, port, ipv6),
        id: None,
        protocol: ProbeProtocol::Http,
        port,
        request_path: Some(POD_PRESENCE_PATH.to_string()),
        interval_in_seconds: Some(interval),
        number_of_probes: Some(count),
    }))
}

fn rule_for_port(
    config: &CloudConfig,
    svc: &Service,
    target: &RuleTarget<'_>,
    port: Option<&ServicePort>,
    protocol: TransportProtocol,
) -> Result<LoadBalancingRule> {
    let idle_timeout = annotations::idle_timeout(svc)?
        .unwrap_or(annotations::DEFAULT_IDLE_TIMEOUT_MINUTES);
    let load_distribution = if service::uses_client_ip_affinity(svc) {
        LoadDistribution::SourceIp
    } else {
        LoadDistribution::Default
    };
    let number = port.map(|p| p.port).unwrap_or_default();
    let mut rule = LoadBalancingRule {
        name: String::new(),
        id: None,
        protocol,
        frontend_ip_configuration: Some(SubResource::new(target.frontend_ip_config_id)),
        backend_address_pool: Some(SubResource::new(target.backend_pool_id)),
        probe: None,
        frontend_port: number,
        backend_port: number,
        enable_floating_ip: Some(true),
        enable_tcp_reset: None,
        disable_outbound_snat: Some(config.disable_outbound_snat),
        idle_timeout_in_minutes: Some(idle_timeout),
        load_distribution: Some(load_distribution),
    };
    if protocol == TransportProtocol::Tcp && config.use_standard_load_balancer() {
        rule.enable_tcp_reset = Some(!service::is_tcp_reset_disabled(svc));
    }
    // Internal IPv6 frontends cannot float; traffic goes to the node port.
    if service::requires_internal_load_balancer(svc)
        && naming::is_backend_pool_ipv6(target.backend_pool_id)
    {
        rule.backend_port = port.and_then(|p| p.node_port).unwrap_or_default();
        rule.enable_floating_ip = Some(false);
    }
    Ok(rule)
}

/// Rules and probes the service wants on the target frontend.
pub fn expected_lb_rules(
    config: &CloudConfig,
    svc: &Service,
    target: &RuleTarget<'_>,
) -> Result<ExpectedRules> {
    let probe_id = |name: &str| {
        SubResource::new(naming::probe_id(
            &config.subscription_id,
            config.load_balancer_resource_group(),
            target.lb_name,
            name,
        ))
    };
    let mut expected = ExpectedRules::default();

    let mut endpoint_probe = node_endpoint_probe(svc, target.ipv6)?;
    let use_shared_probe = config.use_shared_health_probe() && !service::is_local_traffic(svc);
    if use_shared_probe {
        endpoint_probe = Some(cluster_service_shared_probe(config));
    }

    if service::is_ha_mode(svc, config) {
        let Some(rule_name) = naming::ha_mode_rule_name(svc, target.ipv6) else {
            return Ok(expected);
        };
        debug!(lb = target.lb_name, rule = %rule_name, "deriving high availability ports rule");
        let mut rule = rule_for_port(config, svc, target, None, TransportProtocol::All)?;
        rule.name = rule_name.clone();
        rule.enable_tcp_reset = Some(!service::is_tcp_reset_disabled(svc));

        match endpoint_probe {
            Some(probe) => {
                rule.probe = Some(probe_id(&probe.name));
                expected.probes.push(probe);
            }
            None => {
                // The first port whose probe builds wins.
                for port in service::ports(svc) {
                    match port_probe(config, svc, port, &rule_name, None, false) {
                        Ok(Some(probe)) => {
                            rule.probe = Some(probe_id(&probe.name));
                            expected.probes.push(probe);
                            break;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(port = port.port, error = %e, "skipping port probe for high availability rule")
                        }
                    }
                }
            }
        }
        expected.rules.push(rule);
        return Ok(expected);
    }

    let mut endpoint_probe_added = false;
    for port in service::ports(svc) {
        let protocol = port_protocol(port);
        let rule_name = naming::load_balancer_rule_name(svc, protocol, port.port, target.ipv6);
        if annotations::is_port_rule_disabled(svc, port.port) {
            debug!(rule = %rule_name, "load balancing rule disabled by annotation");
            continue;
        }
        if protocol.eq_ignore_ascii_case(PROTOCOL_SCTP)
            && !(config.use_standard_load_balancer() && service::requires_internal_load_balancer(svc))
        {
            return Err(Error::validation(format!(
                "port {} uses SCTP, which is only supported on standard load balancers in internal mode",
                port.port
            )));
        }

        let transport = transport_protocol(protocol)?;
        let mut rule = rule_for_port(config, svc, target, Some(port), transport)?;
        rule.name = rule_name.clone();

        if !annotations::is_port_probe_disabled(svc, port.port) {
            let probe = port_probe(
                config,
                svc,
                port,
                &rule_name,
                endpoint_probe.as_ref(),
                use_shared_probe,
            )
            .inspect_err(|e| warn!(rule = %rule_name, error = %e, "invalid health probe settings"))?;
            if let Some(probe) = probe {
                rule.probe = Some(probe_id(&probe.name));
                expected.probes.push(probe);
            } else if let Some(shared) = &endpoint_probe {
                rule.probe = Some(probe_id(&shared.name));
                if !endpoint_probe_added {
                    expected.probes.push(shared.clone());
                    endpoint_probe_added = true;
                }
            }
        }

        if service::is_floating_ip_disabled(svc) {
            rule.backend_port = port.node_port.unwrap_or_default();
            rule.enable_floating_ip = Some(false);
        }
        expected.rules.push(rule);
    }
    Ok(expected)
}

/// Fail when a service port collides with a rule of another service, an inbound
/// NAT rule or an inbound NAT pool range on the same frontend.
pub fn check_port_conflicts(
    svc: &Service,
    lb: &crate::cloud::types::LoadBalancer,
    frontend_ip_config_id: &str,
) -> Result<()> {
    let prefix = naming::rule_prefix(svc).to_ascii_lowercase();
    let on_frontend = |r: Option<&SubResource>| r.is_some_and(|f| f.same_as(frontend_ip_config_id));
    for port in service::ports(svc) {
        let Ok(protocol) = transport_protocol(port_protocol(port)) else {
            continue;
        };
        for rule in &lb.load_balancing_rules {
            if rule.name.to_ascii_lowercase().starts_with(&prefix) {
                continue;
            }
            if on_frontend(rule.frontend_ip_configuration.as_ref())
                && rule.protocol == protocol
                && rule.frontend_port == port.port
            {
                return Err(Error::validation(format!(
                    "service port {} is trying to consume the port {} which is being referenced by an existing load balancing rule {} with the same protocol {:?} and frontend IP config {frontend_ip_config_id}",
                    port.name.as_deref().unwrap_or_default(),
                    rule.frontend_port,
                    rule.name,
                    rule.protocol
                )));
            }
        }
        for nat in &lb.inbound_nat_rules {
            if on_frontend(nat.frontend_ip_configuration.as_ref())
                && nat.protocol == protocol
                && nat.frontend_port == port.port
            {
                return Err(Error::validation(format!(
                    "service port {} is trying to consume the port {} which is being referenced by an existing inbound NAT rule {} on frontend IP config {frontend_ip_config_id}",
                    port.name.as_deref().unwrap_or_default(),
                    nat.frontend_port,
                    nat.name
                )));
            }
        }
        for pool in &lb.inbound_nat_pools {
            if on_frontend(pool.frontend_ip_configuration.as_ref())
                && pool.protocol == protocol
                && (pool.frontend_port_range_start..=pool.frontend_port_range_end)
                    .contains(&port.port)
            {
                return Err(Error::validation(format!(
                    "service port {} is trying to consume the port {} which is in the range ({}-{}) of an existing inbound NAT pool {} on frontend IP config {frontend_ip_config_id}",
                    port.name.as_deref().unwrap_or_default(),
                    port.port,
                    pool.frontend_port_range_start,
                    pool.frontend_port_range_end,
                    pool.name
                )));
            }
        }
    }
    Ok(())
}
