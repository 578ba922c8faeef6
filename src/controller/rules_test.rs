#[cfg(test)]
mod tests {
    use crate::cloud::types::*;
    use crate::config::{CloudConfig, HEALTH_PROBE_MODE_SHARED};
    use crate::controller::annotations::*;
    use crate::controller::fixtures::*;
    use crate::controller::naming;
    use crate::controller::rules::*;
    use crate::error::Error;

    const FIP: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/frontendIPConfigurations/fip";
    const POOL: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/backendAddressPools/kubernetes";
    const POOL_V6: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/backendAddressPools/kubernetes-IPv6";

    fn target(pool: &str) -> RuleTarget<'_> {
        RuleTarget {
            lb_name: "kubernetes",
            frontend_ip_config_id: FIP,
            backend_pool_id: pool,
            ipv6: false,
        }
    }

    fn derive(config: &CloudConfig, svc: &k8s_openapi::api::core::v1::Service) -> ExpectedRules {
        expected_lb_rules(config, svc, &target(POOL)).unwrap()
    }

    #[test]
    fn one_rule_and_probe_per_port() {
        let svc = web_service("web", "1234-abcd");
        let expected = derive(&config(), &svc);

        assert_eq!(expected.rules.len(), 2);
        assert_eq!(expected.probes.len(), 2);
        assert_eq!(expected.rules[0].name, "a1234abcd-TCP-80");
        assert_eq!(expected.rules[1].name, "a1234abcd-TCP-443");

        let rule = &expected.rules[0];
        assert_eq!(rule.frontend_port, 80);
        assert_eq!(rule.backend_port, 80);
        assert_eq!(rule.enable_floating_ip, Some(true));
        assert_eq!(rule.idle_timeout_in_minutes, Some(4));
        assert_eq!(rule.load_distribution, Some(LoadDistribution::Default));
        // Basic SKU has no TCP reset.
        assert_eq!(rule.enable_tcp_reset, None);
        assert!(rule.probe.as_ref().unwrap().id.ends_with("/probes/a1234abcd-TCP-80"));

        let probe = &expected.probes[0];
        assert_eq!(probe.protocol, ProbeProtocol::Tcp);
        assert_eq!(probe.port, 30080);
        assert_eq!(probe.interval_in_seconds, Some(5));
        assert_eq!(probe.number_of_probes, Some(2));
        assert_eq!(probe.request_path, None);
    }

    #[test]
    fn standard_sku_enables_tcp_reset_unless_disabled() {
        let svc = web_service("web", "1234");
        let expected = derive(&standard_config(), &svc);
        assert_eq!(expected.rules[0].enable_tcp_reset, Some(true));

        let svc = annotate(svc, DISABLE_TCP_RESET, "true");
        let expected = derive(&standard_config(), &svc);
        assert_eq!(expected.rules[0].enable_tcp_reset, Some(false));
    }

    #[test]
    fn udp_ports_get_no_probe() {
        let svc = service("dns", "1234", vec![port("UDP", 53, 30053)]);
        let expected = derive(&config(), &svc);
        assert_eq!(expected.rules.len(), 1);
        assert!(expected.probes.is_empty());
        assert_eq!(expected.rules[0].protocol, TransportProtocol::Udp);
        assert!(expected.rules[0].probe.is_none());
    }

    #[test]
    fn port_annotations_disable_rule_or_probe() {
        let svc = annotate(web_service("web", "1234"), &port_key(80, PORT_NO_LB_RULE), "true");
        let svc = annotate(svc, &port_key(443, PORT_NO_PROBE_RULE), "true");
        let expected = derive(&config(), &svc);

        assert_eq!(expected.rules.len(), 1);
        assert_eq!(expected.rules[0].frontend_port, 443);
        assert!(expected.rules[0].probe.is_none());
        assert!(expected.probes.is_empty());
    }

    #[test]
    fn sctp_requires_internal_standard_load_balancer() {
        let svc = service("sctp", "1234", vec![port("SCTP", 9000, 30900)]);
        let err = expected_lb_rules(&config(), &svc, &target(POOL)).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(err.to_string().contains("9000"));

        let svc = annotate(svc, LOAD_BALANCER_INTERNAL, "true");
        let expected = derive(&standard_config(), &svc);
        assert_eq!(expected.rules[0].protocol, TransportProtocol::All);
        assert!(expected.probes.is_empty());
    }

    #[test]
    fn local_traffic_uses_node_health_check_probe() {
        let mut svc = web_service("web", "1234");
        let spec = svc.spec.as_mut().unwrap();
        spec.external_traffic_policy = Some("Local".into());
        spec.health_check_node_port = Some(32000);

        let expected = derive(&config(), &svc);
        assert_eq!(expected.probes.len(), 1);
        let probe = &expected.probes[0];
        assert_eq!(probe.name, "a1234-TCP-32000");
        assert_eq!(probe.protocol, ProbeProtocol::Http);
        assert_eq!(probe.port, 32000);
        assert_eq!(probe.request_path.as_deref(), Some(POD_PRESENCE_PATH));
        for rule in &expected.rules {
            assert!(rule.probe.as_ref().unwrap().id.ends_with("/probes/a1234-TCP-32000"));
        }
    }

    #[test]
    fn per_port_probe_overrides_node_health_check_probe() {
        let mut svc = web_service("web", "1234");
        let spec = svc.spec.as_mut().unwrap();
        spec.external_traffic_policy = Some("Local".into());
        spec.health_check_node_port = Some(32000);
        let svc = annotate(svc, &health_probe_port_key(443, PROBE_PARAM_PROTOCOL), "http");
        let svc = annotate(svc, &health_probe_port_key(443, PROBE_PARAM_REQUEST_PATH), "/ready");

        let expected = derive(&config(), &svc);
        assert_eq!(expected.probes.len(), 2);
        let https = expected
            .probes
            .iter()
            .find(|p| p.name == "a1234-TCP-443")
            .unwrap();
        assert_eq!(https.protocol, ProbeProtocol::Http);
        assert_eq!(https.request_path.as_deref(), Some("/ready"));
        assert_eq!(https.port, 30443);
    }

    #[test]
    fn shared_probe_mode_for_cluster_traffic() {
        let config = CloudConfig {
            cluster_service_load_balancer_health_probe_mode: HEALTH_PROBE_MODE_SHARED.into(),
            ..config()
        };
        let expected = derive(&config, &web_service("web", "1234"));
        assert_eq!(expected.probes.len(), 1);
        assert_eq!(expected.probes[0].name, naming::SHARED_PROBE_NAME);
        assert_eq!(expected.probes[0].port, 10256);
        assert_eq!(expected.probes[0].request_path.as_deref(), Some("/healthz"));
        assert!(expected
            .rules
            .iter()
            .all(|r| r.probe.as_ref().unwrap().id.ends_with(naming::SHARED_PROBE_NAME)));
    }

    #[test]
    fn https_probe_falls_back_to_tcp_on_basic() {
        let svc = annotate(web_service("web", "1234"), HEALTH_PROBE_PROTOCOL, "https");
        assert_eq!(derive(&config(), &svc).probes[0].protocol, ProbeProtocol::Tcp);
        let probes = derive(&standard_config(), &svc).probes;
        assert_eq!(probes[0].protocol, ProbeProtocol::Https);
        assert_eq!(probes[0].request_path.as_deref(), Some("/"));
    }

    #[test]
    fn probe_port_override_by_number_and_name() {
        let svc = annotate(
            web_service("web", "1234"),
            &health_probe_port_key(80, PROBE_PARAM_PORT),
            "443",
        );
        let svc = annotate(svc, &health_probe_port_key(443, PROBE_PARAM_PORT), "8080");
        let probes = derive(&config(), &svc).probes;
        assert_eq!(probes[0].port, 30443);
        assert_eq!(probes[1].port, 8080);

        let svc = annotate(
            web_service("web", "1234"),
            &health_probe_port_key(80, PROBE_PARAM_PORT),
            "tcp-443",
        );
        assert_eq!(derive(&config(), &svc).probes[0].port, 30443);

        let svc = annotate(
            web_service("web", "1234"),
            &health_probe_port_key(80, PROBE_PARAM_PORT),
            "missing",
        );
        assert!(expected_lb_rules(&config(), &svc, &target(POOL)).is_err());
    }

    #[test]
    fn probe_duration_must_stay_under_two_minutes() {
        let svc = annotate(web_service("web", "1234"), HEALTH_PROBE_INTERVAL, "20");
        let svc = annotate(svc, HEALTH_PROBE_NUM_OF_PROBE, "6");
        let err = expected_lb_rules(&config(), &svc, &target(POOL)).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn floating_ip_disabled_routes_to_node_port() {
        let svc = annotate(web_service("web", "1234"), DISABLE_FLOATING_IP, "true");
        let expected = derive(&config(), &svc);
        assert_eq!(expected.rules[0].backend_port, 30080);
        assert_eq!(expected.rules[0].enable_floating_ip, Some(false));
    }

    #[test]
    fn internal_ipv6_rules_do_not_float() {
        let svc = annotate(web_service("web", "1234"), LOAD_BALANCER_INTERNAL, "true");
        let expected = expected_lb_rules(&config(), &svc, &target(POOL_V6)).unwrap();
        assert_eq!(expected.rules[0].backend_port, 30080);
        assert_eq!(expected.rules[0].enable_floating_ip, Some(false));
    }

    #[test]
    fn session_affinity_and_idle_timeout() {
        let mut svc = annotate(web_service("web", "1234"), LOAD_BALANCER_IDLE_TIMEOUT, "30");
        svc.spec.as_mut().unwrap().session_affinity = Some("ClientIP".into());
        let rule = &derive(&config(), &svc).rules[0];
        assert_eq!(rule.idle_timeout_in_minutes, Some(30));
        assert_eq!(rule.load_distribution, Some(LoadDistribution::SourceIp));

        let svc = annotate(web_service("web", "1234"), LOAD_BALANCER_IDLE_TIMEOUT, "3");
        assert!(expected_lb_rules(&config(), &svc, &target(POOL)).is_err());
    }

    #[test]
    fn ha_mode_collapses_ports_and_takes_first_port_probe() {
        let svc = annotate(web_service("web", "1234"), LOAD_BALANCER_INTERNAL, "true");
        let svc = annotate(svc, ENABLE_HIGH_AVAILABILITY_PORTS, "true");
        let svc = annotate(svc, &health_probe_port_key(443, PROBE_PARAM_PROTOCOL), "http");

        let expected = derive(&standard_config(), &svc);
        assert_eq!(expected.rules.len(), 1);
        let rule = &expected.rules[0];
        assert_eq!(rule.name, "a1234-TCP-80");
        assert_eq!(rule.protocol, TransportProtocol::All);
        assert_eq!(rule.frontend_port, 0);
        assert_eq!(rule.backend_port, 0);
        assert_eq!(rule.enable_tcp_reset, Some(true));

        // The first declared port builds first, so its TCP probe is selected.
        assert_eq!(expected.probes.len(), 1);
        assert_eq!(expected.probes[0].protocol, ProbeProtocol::Tcp);
        assert_eq!(expected.probes[0].port, 30080);
    }

    #[test]
    fn ha_mode_needs_internal_standard_load_balancer() {
        let svc = annotate(web_service("web", "1234"), ENABLE_HIGH_AVAILABILITY_PORTS, "true");
        assert_eq!(derive(&standard_config(), &svc).rules.len(), 2);
    }

    #[test]
    fn port_conflicts_with_foreign_rules_and_nat() {
        let svc = web_service("web", "1234");
        let mut lb = LoadBalancer {
            name: "kubernetes".into(),
            load_balancing_rules: vec![LoadBalancingRule {
                name: "a1234-TCP-80".into(),
                id: None,
                protocol: TransportProtocol::Tcp,
                frontend_ip_configuration: Some(SubResource::new(FIP)),
                backend_address_pool: None,
                probe: None,
                frontend_port: 80,
                backend_port: 80,
                enable_floating_ip: None,
                enable_tcp_reset: None,
                disable_outbound_snat: None,
                idle_timeout_in_minutes: None,
                load_distribution: None,
            }],
            ..Default::default()
        };
        // Own rules never conflict.
        check_port_conflicts(&svc, &lb, FIP).unwrap();

        lb.load_balancing_rules[0].name = "aother-TCP-80".into();
        assert!(check_port_conflicts(&svc, &lb, FIP).is_err());
        // Different frontend.
        assert!(check_port_conflicts(&svc, &lb, "other-fip").is_ok());

        lb.load_balancing_rules.clear();
        lb.inbound_nat_pools.push(InboundNatPool {
            name: "ssh".into(),
            frontend_ip_configuration: Some(SubResource::new(FIP)),
            protocol: TransportProtocol::Tcp,
            frontend_port_range_start: 400,
            frontend_port_range_end: 500,
        });
        let err = check_port_conflicts(&svc, &lb, FIP).unwrap_err();
        assert!(err.to_string().contains("443"));
    }
}
