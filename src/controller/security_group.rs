//! Inbound security rules opening a service's ports on the cluster security group.
//!
//! Rules are owned by name: `{prefix}-{PROTO}-{port}-{source}` belongs to one
//! service, `shared-{PROTO}-{port}-{source}` is consolidated across every
//! service exposing the same port and source, each contributing its
//! destination addresses.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::{debug, info, instrument, warn};

use super::annotations::{self, ALLOWED_IP_RANGES, ALLOWED_SERVICE_TAGS, DENY_ALL_EXCEPT_LOAD_BALANCER_SOURCE_RANGES};
use super::context::ReconcileContext;
use super::naming;
use super::rules::{port_protocol, PROTOCOL_SCTP, PROTOCOL_TCP, PROTOCOL_UDP};
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{
    SecurityGroup, SecurityRule, SecurityRuleAccess, SecurityRuleDirection, SecurityRuleProtocol,
};
use crate::config;
use crate::error::{Error, Result};

pub const CONFLICT_CONFIGURATION_EVENT_REASON: &str = "ConflictConfiguration";
pub const INVALID_CONFIGURATION_EVENT_REASON: &str = "InvalidConfiguration";

pub const INTERNET_SOURCE: &str = "Internet";
const DENY_ALL_SOURCE: &str = "deny_all";
const ANY: &str = "*";

/// Who may reach a service, as declared on the service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessControl {
    pub source_ranges: Vec<IpNet>,
    pub invalid_ranges: Vec<String>,
    pub service_tags: Vec<String>,
    pub internal: bool,
    pub deny_all_except_source_ranges: bool,
}

impl AccessControl {
    pub fn from_service(svc: &Service) -> Self {
        let mut raw: Vec<String> = svc
            .spec
            .as_ref()
            .and_then(|s| s.load_balancer_source_ranges.clone())
            .unwrap_or_default();
        if let Some(value) = annotations::get(svc, ALLOWED_IP_RANGES) {
            raw.extend(annotations::split_list(value));
        }
        let mut source_ranges = Vec::new();
        let mut invalid_ranges = Vec::new();
        for range in raw {
            let range = range.trim().to_string();
            if range.is_empty() {
                continue;
            }
            match range.parse::<IpNet>() {
                Ok(net) => source_ranges.push(net.trunc()),
                Err(_) => invalid_ranges.push(range),
            }
        }
        source_ranges.sort();
        source_ranges.dedup();

        Self {
            source_ranges,
            invalid_ranges,
            service_tags: annotations::get(svc, ALLOWED_SERVICE_TAGS)
                .map(annotations::split_list)
                .unwrap_or_default(),
            internal: service::requires_internal_load_balancer(svc),
            deny_all_except_source_ranges: annotations::is_true(
                svc,
                DENY_ALL_EXCEPT_LOAD_BALANCER_SOURCE_RANGES,
            ),
        }
    }

    /// Nothing restricts the sources.
    pub fn allows_all(&self) -> bool {
        self.invalid_ranges.is_empty()
            && (self.source_ranges.is_empty()
                || self.source_ranges.iter().any(|net| net.prefix_len() == 0))
    }

    /// Source prefixes of one family. External services default to `Internet`;
    /// internal ones stay within the virtual network unless ranges are given.
    pub fn sources(&self, ipv6: bool) -> Vec<String> {
        if self.allows_all() && self.service_tags.is_empty() {
            if self.internal {
                return Vec::new();
            }
            return vec![INTERNET_SOURCE.to_string()];
        }
        let mut out: Vec<String> = self
            .source_ranges
            .iter()
            .filter(|net| matches!(net, IpNet::V6(_)) == ipv6)
            .map(ToString::to_string)
            .collect();
        out.extend(self.service_tags.iter().cloned());
        out
    }

    /// A deny rule for every other source follows the allow rules.
    pub fn denies_others(&self) -> bool {
        !self.invalid_ranges.is_empty()
            || (self.deny_all_except_source_ranges && !self.allows_all())
    }
}

pub fn allows_consolidation(rule: &SecurityRule) -> bool {
    rule.name
        .to_ascii_lowercase()
        .starts_with(naming::SHARED_SECURITY_RULE_PREFIX)
}

pub fn security_protocol(port: &ServicePort) -> Result<SecurityRuleProtocol> {
    match port_protocol(port).to_ascii_uppercase().as_str() {
        PROTOCOL_TCP => Ok(SecurityRuleProtocol::Tcp),
        PROTOCOL_UDP => Ok(SecurityRuleProtocol::Udp),
        PROTOCOL_SCTP => Ok(SecurityRuleProtocol::Asterisk),
        other => Err(Error::validation(format!(
            "unsupported service port protocol {other:?}"
        ))),
    }
}

/// Port the traffic reaches: the node port when floating IP is disabled.
pub fn destination_port(svc: &Service, port: &ServicePort) -> String {
    match port.node_port {
        Some(node_port) if service::is_floating_ip_disabled(svc) => node_port.to_string(),
        _ => port.port.to_string(),
    }
}

/// Structural equality of security rules. Destinations are ignored when either
/// side is consolidated so a shared rule can absorb more addresses.
pub fn security_rule_matches(existing: &SecurityRule, wanted: &SecurityRule) -> bool {
    if !existing.name.eq_ignore_ascii_case(&wanted.name)
        || existing.protocol != wanted.protocol
        || !existing.source_port_range.eq_ignore_ascii_case(&wanted.source_port_range)
        || !existing
            .destination_port_range
            .eq_ignore_ascii_case(&wanted.destination_port_range)
        || !existing
            .source_address_prefix
            .as_deref()
            .unwrap_or_default()
            .eq_ignore_ascii_case(wanted.source_address_prefix.as_deref().unwrap_or_default())
    {
        return false;
    }
    if !allows_consolidation(existing) && !allows_consolidation(wanted) {
        let mut a = existing.destinations();
        let mut b = wanted.destinations();
        a.sort();
        b.sort();
        if a != b {
            return false;
        }
    }
    existing.access == wanted.access && existing.direction == wanted.direction
}

fn service_owns_security_rule(svc: &Service, rule: &SecurityRule) -> bool {
    let prefix = format!("{}-", naming::rule_prefix(svc)).to_ascii_lowercase();
    rule.name.to_ascii_lowercase().starts_with(&prefix)
}

/// Addresses a service is reachable on: ingress status and requested IPs.
pub fn service_ingress_ips(svc: &Service) -> BTreeSet<String> {
    let mut ips: BTreeSet<String> = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|i| i.ip.clone())
        .collect();
    ips.extend(service::load_balancer_ips(svc));
    ips
}

/// Allow and deny rules a service needs for one family, without priorities.
pub fn expected_security_rules(
    svc: &Service,
    access: &AccessControl,
    destinations: &[String],
    ipv6: bool,
) -> Result<Vec<SecurityRule>> {
    if destinations.is_empty() {
        return Ok(Vec::new());
    }
    let sources = access.sources(ipv6);
    let mut rules = Vec::new();
    for port in service::ports(svc) {
        let protocol = security_protocol(port)?;
        let dst_port = destination_port(svc, port);
        let mut push = |source: &str, prefix: &str, allow: bool| {
            let mut rule = SecurityRule {
                name: naming::security_rule_name(svc, port, source, ipv6),
                protocol,
                source_port_range: ANY.to_string(),
                destination_port_range: dst_port.clone(),
                source_address_prefix: Some(prefix.to_string()),
                destination_address_prefix: None,
                destination_address_prefixes: Vec::new(),
                access: if allow {
                    SecurityRuleAccess::Allow
                } else {
                    SecurityRuleAccess::Deny
                },
                priority: 0,
                direction: SecurityRuleDirection::Inbound,
            };
            rule.set_destinations(destinations.to_vec());
            rules.push(rule);
        };
        for source in &sources {
            push(source, source, true);
        }
        if access.denies_others() {
            push(DENY_ALL_SOURCE, ANY, false);
        }
    }
    Ok(rules)
}

/// Addresses of `dsts` also used by another service, with the ports that
/// service still needs open on them.
pub type RetainedPorts = BTreeMap<String, BTreeSet<(SecurityRuleProtocol, String)>>;

impl ReconcileContext {
    async fn shared_ip_port_mapping(&self, svc: &Service, dsts: &BTreeSet<String>) -> Result<RetainedPorts> {
        let mut retained = RetainedPorts::new();
        if dsts.is_empty() {
            return Ok(retained);
        }
        let me = service::service_name(svc);
        for other in self.lister.list_load_balancer_services().await? {
            if service::service_name(&other) == me || !service::is_load_balancer_service(&other) {
                continue;
            }
            let shared: Vec<String> = service_ingress_ips(&other)
                .into_iter()
                .filter(|ip| dsts.contains(ip))
                .collect();
            if shared.is_empty() {
                continue;
            }
            for port in service::ports(&other) {
                let Ok(protocol) = security_protocol(port) else {
                    continue;
                };
                let dst_port = destination_port(&other, port);
                for ip in &shared {
                    retained
                        .entry(ip.clone())
                        .or_default()
                        .insert((protocol, dst_port.clone()));
                }
            }
        }
        Ok(retained)
    }

    async fn warn_about_access_control(&self, svc: &Service, access: &AccessControl) {
        if !access.source_ranges.is_empty() && !access.service_tags.is_empty() {
            let message = format!(
                "Please use annotation {ALLOWED_IP_RANGES} instead of spec.loadBalancerSourceRanges while using {ALLOWED_SERVICE_TAGS} annotation at the same time."
            );
            self.events
                .warn(svc, CONFLICT_CONFIGURATION_EVENT_REASON, &message)
                .await;
        }
        if !access.invalid_ranges.is_empty() {
            let message = format!(
                "Found invalid LoadBalancerSourceRanges {:?}, ignoring and adding a default DenyAll rule in security group.",
                access.invalid_ranges
            );
            self.events
                .warn(svc, INVALID_CONFIGURATION_EVENT_REASON, &message)
                .await;
        }
    }

    /// Destination addresses of the service split `(v4, v6)`: additional public
    /// IPs plus either the frontend IPs or, without floating IP, the backends.
    async fn security_destinations(
        &self,
        svc: &Service,
        lb_ips: &[String],
        lb_name: Option<&str>,
        want_lb: bool,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut push = |ip: String| {
            if ip.contains(':') {
                v6.push(ip);
            } else {
                v4.push(ip);
            }
        };
        match service::additional_public_ips(svc) {
            Ok(ips) => ips.into_iter().for_each(&mut push),
            Err(e) if want_lb => return Err(e),
            Err(e) => debug!(error = %e, "ignoring additional public IPs while deleting"),
        }

        if service::is_floating_ip_disabled(svc) {
            let lb = match lb_name {
                Some(name) => self.store.get_load_balancer(name, CacheReadType::Default).await?,
                None => None,
            };
            match lb {
                Some(lb) => {
                    let (bv4, bv6) = self.backend_private_ips(&lb).await;
                    bv4.into_iter().chain(bv6).for_each(&mut push);
                }
                None if want_lb => {
                    return Err(Error::not_found("LoadBalancer", lb_name.unwrap_or_default()));
                }
                None => {}
            }
        } else {
            lb_ips.iter().cloned().for_each(&mut push);
        }
        Ok((v4, v6))
    }

    /// Converge the security group to what `svc` needs. With `want_lb = false`
    /// the service's rules are removed and its addresses withdrawn from shared
    /// rules, except where another service on the same address still needs
    /// the port.
    #[instrument(skip_all, fields(service = %service::service_name(svc), want_lb))]
    pub async fn reconcile_security_group(
        &self,
        svc: &Service,
        lb_ips: &[String],
        lb_name: Option<&str>,
        want_lb: bool,
    ) -> Result<SecurityGroup> {
        if want_lb && lb_ips.is_empty() {
            return Err(Error::validation(format!(
                "no load balancer IP for setting up security rules for service {}",
                service::service_name(svc)
            )));
        }
        let mut sg = self
            .store
            .get_security_group(CacheReadType::Default)
            .await?
            .ok_or_else(|| Error::not_found("SecurityGroup", &self.config.security_group_name))?;

        let access = AccessControl::from_service(svc);
        if want_lb {
            self.warn_about_access_control(svc, &access).await;
        }

        let (dst_v4, dst_v6) = self
            .security_destinations(svc, lb_ips, lb_name, want_lb)
            .await?;
        let dsts: BTreeSet<String> = dst_v4.iter().chain(dst_v6.iter()).cloned().collect();

        let mut expected = Vec::new();
        if want_lb {
            let (v4, v6) = service::ip_families(svc);
            if v4 {
                expected.extend(expected_security_rules(svc, &access, &dst_v4, false)?);
            }
            if v6 {
                expected.extend(expected_security_rules(svc, &access, &dst_v6, true)?);
            }
        }

        let retained = self.shared_ip_port_mapping(svc, &dsts).await?;
        let mut changed = clean_security_rules(&mut sg, svc, &expected, &dsts, &retained);
        changed |= patch_security_rules(&mut sg, expected)?;
        if config::reconcile_tags(&mut sg.tags, &self.config.parsed_tags()) {
            changed = true;
        }

        if changed {
            info!(security_group = %sg.name, rules = sg.security_rules.len(), "updating security group");
            self.store.create_or_update_security_group(&sg).await?;
        } else {
            debug!(security_group = %sg.name, "security group is up to date");
        }
        Ok(sg)
    }
}

/// Drop rules the service no longer needs. Returns whether anything changed.
pub fn clean_security_rules(
    sg: &mut SecurityGroup,
    svc: &Service,
    expected: &[SecurityRule],
    dsts: &BTreeSet<String>,
    retained: &RetainedPorts,
) -> bool {
    let mut changed = false;
    let mut kept = Vec::with_capacity(sg.security_rules.len());
    for mut rule in std::mem::take(&mut sg.security_rules) {
        if expected.iter().any(|e| security_rule_matches(&rule, e)) {
            kept.push(rule);
            continue;
        }
        if allows_consolidation(&rule) {
            let current = rule.destinations();
            let remaining: Vec<String> = current
                .iter()
                .filter(|ip| {
                    !dsts.contains(*ip)
                        || retained.get(*ip).is_some_and(|ports| {
                            ports.contains(&(rule.protocol, rule.destination_port_range.clone()))
                        })
                })
                .cloned()
                .collect();
            if remaining.len() == current.len() {
                kept.push(rule);
                continue;
            }
            changed = true;
            if remaining.is_empty() {
                debug!(rule = %rule.name, "dropping shared security rule without destinations");
                continue;
            }
            debug!(rule = %rule.name, "withdrawing destinations from shared security rule");
            rule.set_destinations(remaining);
            kept.push(rule);
        } else if service_owns_security_rule(svc, &rule) {
            debug!(rule = %rule.name, "dropping stale security rule");
            changed = true;
        } else {
            kept.push(rule);
        }
    }
    sg.security_rules = kept;
    changed
}

/// Add or fix the expected rules, giving new ones the lowest free priority.
pub fn patch_security_rules(sg: &mut SecurityGroup, expected: Vec<SecurityRule>) -> Result<bool> {
    let mut changed = false;
    for mut wanted in expected {
        if let Some(existing) = sg
            .security_rules
            .iter_mut()
            .find(|r| security_rule_matches(r, &wanted))
        {
            if allows_consolidation(existing) {
                let mut merged = existing.destinations();
                let before = merged.len();
                merged.extend(wanted.destinations());
                merged.sort();
                merged.dedup();
                if merged.len() != before {
                    existing.set_destinations(merged);
                    changed = true;
                }
            }
            continue;
        }
        if let Some(existing) = sg
            .security_rules
            .iter_mut()
            .find(|r| r.name.eq_ignore_ascii_case(&wanted.name))
        {
            warn!(rule = %wanted.name, "security rule differs, replacing it in place");
            if allows_consolidation(existing) {
                let mut merged = existing.destinations();
                merged.extend(wanted.destinations());
                wanted.set_destinations(merged);
            }
            wanted.priority = existing.priority;
            *existing = wanted;
            changed = true;
            continue;
        }
        wanted.priority = naming::next_available_priority(&sg.security_rules)?;
        debug!(rule = %wanted.name, priority = wanted.priority, "adding security rule");
        sg.security_rules.push(wanted);
        changed = true;
    }
    Ok(changed)
}
