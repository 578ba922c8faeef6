//! Set-difference of load balancing rules and probes.
//!
//! Only rules and probes owned by the service are candidates for removal;
//! everything else on the load balancer is left untouched.

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use super::naming;
use super::service;
use crate::cloud::types::{LoadBalancer, LoadBalancingRule, Probe};

/// A rule or probe belongs to the service when its name carries the service's
/// rule prefix. Non-local services also own the cluster shared probe.
pub fn service_owns_rule(svc: &Service, name: &str) -> bool {
    if !service::is_local_traffic(svc) && name == naming::SHARED_PROBE_NAME {
        return true;
    }
    name.to_ascii_uppercase()
        .starts_with(&naming::rule_prefix(svc).to_ascii_uppercase())
}

fn find_probe(probes: &[Probe], probe: &Probe) -> bool {
    probes.iter().any(|p| p.equivalent_to(probe))
}

fn find_rule(rules: &[LoadBalancingRule], rule: &LoadBalancingRule, want_lb: bool) -> bool {
    rules
        .iter()
        .any(|r| r.name.eq_ignore_ascii_case(&rule.name) && r.equivalent_to(rule, want_lb))
}

/// Rules of other services that still point at `probe`.
fn foreign_rules_using_probe<'a>(
    svc: &Service,
    lb: &'a LoadBalancer,
    probe: &Probe,
) -> impl Iterator<Item = &'a LoadBalancingRule> + 'a {
    let probe_name = probe.name.clone();
    let prefix = naming::rule_prefix(svc).to_ascii_uppercase();
    lb.load_balancing_rules.iter().filter(move |rule| {
        let references = rule.probe.as_ref().is_some_and(|p| {
            naming::last_segment(&p.id)
                .map(|name| name.eq_ignore_ascii_case(&probe_name))
                .unwrap_or(false)
        });
        references && !rule.name.to_ascii_uppercase().starts_with(&prefix)
    })
}

/// Keep the cluster shared probe in the expected set while another service's
/// rule still references it.
pub fn keep_shared_probe(svc: &Service, lb: &LoadBalancer, expected: &mut Vec<Probe>) -> bool {
    let Some(shared) = lb
        .probes
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(naming::SHARED_PROBE_NAME))
    else {
        return false;
    };
    if find_probe(expected, shared) {
        return false;
    }
    if foreign_rules_using_probe(svc, lb, shared).next().is_some() {
        debug!(
            service = %service::service_name(svc),
            "shared probe still referenced by another service, keeping it"
        );
        expected.push(shared.clone());
        return true;
    }
    false
}

/// Drop owned probes that are not expected and add missing expected ones.
/// Returns whether the probe list changed.
pub fn reconcile_probes(
    lb: &mut LoadBalancer,
    svc: &Service,
    want_lb: bool,
    mut expected: Vec<Probe>,
) -> bool {
    let name = service::service_name(svc);
    keep_shared_probe(svc, lb, &mut expected);

    let mut dirty = false;
    let before = lb.probes.len();
    lb.probes.retain(|existing| {
        let keep = !service_owns_rule(svc, &existing.name) || find_probe(&expected, existing);
        if !keep {
            info!(service = %name, want_lb, probe = %existing.name, "dropping probe");
        }
        keep
    });
    dirty |= lb.probes.len() != before;

    for probe in expected {
        if !find_probe(&lb.probes, &probe) {
            debug!(service = %name, want_lb, probe = %probe.name, "adding probe");
            lb.probes.push(probe);
            dirty = true;
        }
    }
    dirty
}

/// Drop owned rules that are not expected and add missing expected ones.
/// Returns whether the rule list changed.
pub fn reconcile_rules(
    lb: &mut LoadBalancer,
    svc: &Service,
    want_lb: bool,
    expected: Vec<LoadBalancingRule>,
) -> bool {
    let name = service::service_name(svc);
    let mut dirty = false;
    let before = lb.load_balancing_rules.len();
    lb.load_balancing_rules.retain(|existing| {
        let keep = !service_owns_rule(svc, &existing.name)
            || find_rule(&expected, existing, want_lb);
        if !keep {
            info!(service = %name, want_lb, rule = %existing.name, "dropping load balancing rule");
        }
        keep
    });
    dirty |= lb.load_balancing_rules.len() != before;

    for rule in expected {
        if !find_rule(&lb.load_balancing_rules, &rule, want_lb) {
            debug!(service = %name, want_lb, rule = %rule.name, "adding load balancing rule");
            lb.load_balancing_rules.push(rule);
            dirty = true;
        }
    }
    dirty
}
