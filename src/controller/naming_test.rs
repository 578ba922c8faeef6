#[cfg(test)]
mod tests {
    use crate::cloud::types::{SecurityRule, SecurityRuleAccess, SecurityRuleDirection, SecurityRuleProtocol};
    use crate::controller::annotations::*;
    use crate::controller::fixtures::*;
    use crate::controller::naming::*;

    fn dual_stack(mut svc: k8s_openapi::api::core::v1::Service) -> k8s_openapi::api::core::v1::Service {
        if let Some(spec) = svc.spec.as_mut() {
            spec.ip_families = Some(vec!["IPv4".into(), "IPv6".into()]);
        }
        svc
    }

    fn rule_with_priority(priority: i32) -> SecurityRule {
        SecurityRule {
            name: format!("rule-{priority}"),
            protocol: SecurityRuleProtocol::Tcp,
            source_port_range: "*".into(),
            destination_port_range: "80".into(),
            source_address_prefix: Some("Internet".into()),
            destination_address_prefix: Some("20.0.0.1".into()),
            destination_address_prefixes: Vec::new(),
            access: SecurityRuleAccess::Allow,
            priority,
            direction: SecurityRuleDirection::Inbound,
        }
    }

    #[test]
    fn test_rule_prefix_strips_dashes_and_truncates() {
        let svc = web_service("web", "1234-abcd");
        assert_eq!(rule_prefix(&svc), "a1234abcd");

        let long = web_service("web", "01234567-89ab-cdef-0123-456789abcdef");
        let prefix = rule_prefix(&long);
        assert_eq!(prefix.len(), 32);
        assert!(prefix.starts_with("a0123456789abcdef"));
    }

    #[test]
    fn test_ipv6_suffix_only_for_dual_stack() {
        let single = web_service("web", "1234-abcd");
        let dual = dual_stack(web_service("web", "1234-abcd"));

        assert_eq!(frontend_ip_config_name(&single, true), "a1234abcd");
        assert_eq!(frontend_ip_config_name(&dual, false), "a1234abcd");
        assert_eq!(frontend_ip_config_name(&dual, true), "a1234abcd-IPv6");
        assert_eq!(load_balancer_rule_name(&dual, "TCP", 80, true), "a1234abcd-TCP-80-IPv6");
        assert!(has_ipv6_suffix("a1234abcd-ipv6"));
    }

    #[test]
    fn test_internal_subnet_lands_in_rule_and_frontend_names() {
        let svc = annotate(
            annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE),
            LOAD_BALANCER_INTERNAL_SUBNET,
            "backend",
        );

        assert_eq!(load_balancer_rule_name(&svc, "TCP", 80, false), "a1234abcd-backend-TCP-80");
        assert_eq!(frontend_ip_config_name(&svc, false), "a1234abcd-backend");
    }

    #[test]
    fn test_long_subnet_is_shortened_to_fit() {
        let subnet = "s".repeat(100);
        let svc = annotate(
            annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE),
            LOAD_BALANCER_INTERNAL_SUBNET,
            &subnet,
        );

        let rule = load_balancer_rule_name(&svc, "TCP", 80, false);
        assert!(rule.len() <= LOAD_BALANCER_RULE_NAME_MAX_LENGTH - IP_FAMILY_SUFFIX_LENGTH);
        assert!(rule.ends_with("-TCP-80"));

        let frontend = frontend_ip_config_name(&svc, false);
        assert_eq!(frontend.len(), FRONTEND_IP_CONFIG_NAME_MAX_LENGTH - IP_FAMILY_SUFFIX_LENGTH);
    }

    #[test]
    fn test_public_ip_name_includes_prefix_segment() {
        let svc = web_service("web", "1234-abcd");
        assert_eq!(public_ip_name("kubernetes", &svc, false), "kubernetes-a1234abcd");

        let with_prefix = annotate(
            svc,
            PIP_PREFIX_ID,
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPPrefixes/prefix1",
        );
        assert_eq!(
            public_ip_name("kubernetes", &with_prefix, false),
            "kubernetes-a1234abcd-prefix1"
        );
    }

    #[test]
    fn test_shared_security_rule_name_ignores_service() {
        let svc = annotate(web_service("web", "1234-abcd"), SHARED_SECURITY_RULE, TRUE_VALUE);
        let port = port("TCP", 80, 30080);

        assert_eq!(security_rule_name(&svc, &port, "Internet", false), "shared-TCP-80-Internet");
        assert_eq!(
            security_rule_name(&web_service("web", "1234-abcd"), &port, "10.0.0.0/8", false),
            "a1234abcd-TCP-80-10.0.0.0_8"
        );
    }

    #[test]
    fn test_trim_internal_suffix_is_case_insensitive() {
        assert_eq!(trim_internal_suffix("kubernetes-internal"), "kubernetes");
        assert_eq!(trim_internal_suffix("kubernetes-INTERNAL"), "kubernetes");
        assert_eq!(trim_internal_suffix("kubernetes"), "kubernetes");
        assert_eq!(trim_internal_suffix("-internal"), "");
    }

    #[test]
    fn test_resource_ids() {
        assert_eq!(
            frontend_ip_config_id("sub", "rg", "kubernetes", "fip"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/frontendIPConfigurations/fip"
        );
        assert_eq!(
            subnet_id("sub", "rg", "vnet", "subnet"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/subnet"
        );
        assert_eq!(last_segment(&public_ip_id("sub", "rg", "pip")).unwrap(), "pip");
        assert!(last_segment("/subscriptions/sub/").is_err());
    }

    #[test]
    fn test_route_names_round_trip_to_node() {
        assert_eq!(route_name("node-0", "10.244.0.0/24", false), "node-0");

        let name = route_name("node-0", "fd00::/64", true);
        assert_eq!(name, "node-0____fd0064");
        assert_eq!(node_name_from_route(&name), "node-0");
        assert_eq!(node_name_from_route("node-1"), "node-1");
    }

    #[test]
    fn test_next_available_priority_fills_gaps() {
        assert_eq!(next_available_priority(&[]).unwrap(), 500);

        let rules = vec![rule_with_priority(500), rule_with_priority(501), rule_with_priority(503)];
        assert_eq!(next_available_priority(&rules).unwrap(), 502);
    }

    #[test]
    fn test_next_available_priority_exhausted() {
        let rules: Vec<SecurityRule> = (SECURITY_RULE_MINIMUM_PRIORITY..SECURITY_RULE_MAXIMUM_PRIORITY)
            .map(rule_with_priority)
            .collect();
        assert!(next_available_priority(&rules).is_err());
    }

    #[test]
    fn test_backend_pool_names() {
        assert_eq!(backend_pool_name("kubernetes", false), "kubernetes");
        assert_eq!(backend_pool_name("kubernetes", true), "kubernetes-IPv6");
        assert!(is_backend_pool_ipv6("kubernetes-IPv6"));
        assert!(!is_backend_pool_ipv6("kubernetes"));
    }
}
