#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    use crate::cloud::types::{
        FrontendIpConfiguration, LoadBalancer, LoadBalancerSku, LoadBalancingRule, TransportProtocol,
    };
    use crate::config::{CloudConfig, MultipleStandardLoadBalancerConfiguration};
    use crate::controller::annotations::*;
    use crate::controller::fixtures::*;
    use crate::controller::selection::*;
    use crate::error::Error;

    fn rule(name: &str) -> LoadBalancingRule {
        LoadBalancingRule {
            name: name.to_string(),
            id: None,
            protocol: TransportProtocol::Tcp,
            frontend_ip_configuration: None,
            backend_address_pool: None,
            probe: None,
            frontend_port: 80,
            backend_port: 80,
            enable_floating_ip: None,
            enable_tcp_reset: None,
            disable_outbound_snat: None,
            idle_timeout_in_minutes: None,
            load_distribution: None,
        }
    }

    fn lb(name: &str, rules: usize) -> LoadBalancer {
        LoadBalancer {
            name: name.to_string(),
            load_balancing_rules: (0..rules).map(|i| rule(&format!("r{i}"))).collect(),
            ..Default::default()
        }
    }

    fn selector(key: &str, value: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn multi_slb_config() -> CloudConfig {
        CloudConfig {
            multiple_standard_load_balancer_configurations: vec![
                MultipleStandardLoadBalancerConfiguration {
                    name: "kubernetes".into(),
                    primary_vm_set: "agentpool".into(),
                    ..Default::default()
                },
                MultipleStandardLoadBalancerConfiguration {
                    name: "lb2".into(),
                    service_label_selector: Some(selector("app", "web")),
                    ..Default::default()
                },
                MultipleStandardLoadBalancerConfiguration {
                    name: "lb3".into(),
                    allow_service_placement: Some(false),
                    ..Default::default()
                },
            ],
            ..standard_config()
        }
    }

    fn labeled(app: &str) -> k8s_openapi::api::core::v1::Service {
        let mut svc = web_service("web", "1234-abcd");
        svc.metadata.labels = Some(BTreeMap::from([("app".to_string(), app.to_string())]));
        svc
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_most_eligible_keeps_current_configuration() {
        let eligible = names(&["kubernetes", "lb2"]);
        assert_eq!(
            most_eligible_load_balancer(Some("lb2"), &eligible, &[], false),
            "lb2"
        );
        assert_eq!(
            most_eligible_load_balancer(Some("lb3"), &eligible, &[], false),
            "kubernetes"
        );
    }

    #[test]
    fn test_most_eligible_prefers_missing_then_fewest_rules() {
        let eligible = names(&["kubernetes", "lb2"]);

        let existing = vec![lb("kubernetes", 3)];
        assert_eq!(most_eligible_load_balancer(None, &eligible, &existing, false), "lb2");

        let existing = vec![lb("kubernetes", 3), lb("lb2", 1)];
        assert_eq!(most_eligible_load_balancer(None, &eligible, &existing, false), "lb2");
        let existing = vec![lb("kubernetes", 1), lb("lb2", 3)];
        assert_eq!(
            most_eligible_load_balancer(None, &eligible, &existing, false),
            "kubernetes"
        );

        // External load balancers do not count for an internal service.
        assert_eq!(
            most_eligible_load_balancer(None, &eligible, &existing, true),
            "kubernetes"
        );
        let internal = vec![lb("kubernetes-internal", 5), lb("lb2-internal", 2)];
        assert_eq!(most_eligible_load_balancer(None, &eligible, &internal, true), "lb2");
    }

    #[tokio::test]
    async fn test_eligible_load_balancers_apply_selectors() {
        let h = harness(multi_slb_config());

        assert_eq!(
            h.ctx
                .eligible_load_balancers(&web_service("web", "1234-abcd"))
                .await
                .unwrap(),
            names(&["kubernetes"])
        );
        // A matching selector wins over configurations without one.
        assert_eq!(
            h.ctx.eligible_load_balancers(&labeled("web")).await.unwrap(),
            names(&["lb2"])
        );
        assert_eq!(
            h.ctx.eligible_load_balancers(&labeled("api")).await.unwrap(),
            names(&["kubernetes"])
        );
    }

    #[tokio::test]
    async fn test_closed_configuration_keeps_its_services() {
        let h = harness(multi_slb_config());
        let svc = web_service("web", "1234-abcd");
        h.ctx.update_service_placement_status(true, "default/web", "lb3");

        assert_eq!(
            h.ctx.eligible_load_balancers(&svc).await.unwrap(),
            names(&["kubernetes", "lb3"])
        );
        assert_eq!(h.ctx.current_multi_slb_name(&svc).as_deref(), Some("lb3"));
    }

    #[tokio::test]
    async fn test_requested_configurations_must_exist_and_accept() {
        let h = harness(multi_slb_config());

        let pinned = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_CONFIGURATIONS, "LB3");
        let err = h.ctx.eligible_load_balancers(&pinned).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(ref m) if m.contains("do not allow service placement")));

        let unknown = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_CONFIGURATIONS, "nope");
        assert!(matches!(
            h.ctx.eligible_load_balancers(&unknown).await,
            Err(Error::ValidationError(_))
        ));

        let both = annotate(
            web_service("web", "1234-abcd"),
            LOAD_BALANCER_CONFIGURATIONS,
            "kubernetes, lb3",
        );
        assert_eq!(
            h.ctx.eligible_load_balancers(&both).await.unwrap(),
            names(&["kubernetes"])
        );
    }

    #[tokio::test]
    async fn test_namespace_selector() {
        let mut cfg = multi_slb_config();
        cfg.multiple_standard_load_balancer_configurations[1].service_label_selector = None;
        cfg.multiple_standard_load_balancer_configurations[1].service_namespace_selector =
            Some(selector("env", "prod"));
        let h = harness(cfg);
        let svc = web_service("web", "1234-abcd");

        assert_eq!(
            h.ctx.eligible_load_balancers(&svc).await.unwrap(),
            names(&["kubernetes"])
        );

        h.lister.set_namespace_labels(
            "default",
            BTreeMap::from([("env".to_string(), "prod".to_string())]),
        );
        assert_eq!(
            h.ctx.eligible_load_balancers(&svc).await.unwrap(),
            names(&["lb2"])
        );
    }

    #[test]
    fn test_should_change_load_balancer() {
        let standard = harness(standard_config());
        let svc = web_service("web", "1234-abcd");
        assert!(standard.ctx.should_change_load_balancer(&svc, "kubernetes", "other"));
        assert!(!standard.ctx.should_change_load_balancer(&svc, "Kubernetes", "kubernetes"));

        let basic = harness(config());
        assert!(!basic.ctx.should_change_load_balancer(&svc, "pool2", "kubernetes"));

        let auto = annotate(svc.clone(), LOAD_BALANCER_MODE, LOAD_BALANCER_AUTO_MODE_VALUE);
        assert!(!basic.ctx.should_change_load_balancer(&auto, "pool2", "kubernetes"));

        let primary = annotate(svc.clone(), LOAD_BALANCER_MODE, "agentpool");
        assert!(!basic.ctx.should_change_load_balancer(&primary, "kubernetes", "kubernetes"));
        assert!(basic.ctx.should_change_load_balancer(&primary, "pool2", "kubernetes"));

        let pinned = annotate(svc, LOAD_BALANCER_MODE, "pool2");
        assert!(!basic.ctx.should_change_load_balancer(&pinned, "pool2-internal", "kubernetes"));
        assert!(basic.ctx.should_change_load_balancer(&pinned, "kubernetes", "kubernetes"));
    }

    #[tokio::test]
    async fn test_select_new_basic_load_balancer() {
        let h = harness(config());

        let (selected, exists) = h
            .ctx
            .select_load_balancer(&web_service("web", "1234-abcd"), &[], &nodes(2))
            .await
            .unwrap();
        assert!(!exists);
        assert_eq!(selected.name, "kubernetes");
        assert_eq!(selected.sku, Some(LoadBalancerSku::Basic));

        let internal = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE);
        let (selected, _) = h.ctx.select_load_balancer(&internal, &[], &nodes(2)).await.unwrap();
        assert_eq!(selected.name, "kubernetes-internal");
    }

    #[tokio::test]
    async fn test_select_respects_rule_limit() {
        let mut cfg = config();
        cfg.maximum_load_balancer_rule_count = 2;
        let h = harness(cfg);
        let svc = web_service("web", "1234-abcd");

        let (selected, exists) = h
            .ctx
            .select_load_balancer(&svc, &[lb("kubernetes", 1)], &nodes(1))
            .await
            .unwrap();
        assert!(exists);
        assert_eq!(selected.load_balancing_rules.len(), 1);

        let err = h
            .ctx
            .select_load_balancer(&svc, &[lb("kubernetes", 2)], &nodes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_auto_mode_spreads_over_vm_sets() {
        let h = harness(config());
        h.cloud.set_node_vm_set("node-1", "pool2");
        let svc = annotate(
            web_service("web", "1234-abcd"),
            LOAD_BALANCER_MODE,
            LOAD_BALANCER_AUTO_MODE_VALUE,
        );

        let (selected, exists) = h
            .ctx
            .select_load_balancer(&svc, &[lb("kubernetes", 1)], &nodes(2))
            .await
            .unwrap();
        assert!(!exists);
        assert_eq!(selected.name, "pool2");

        let (selected, exists) = h
            .ctx
            .select_load_balancer(&svc, &[lb("kubernetes", 3), lb("pool2", 1)], &nodes(2))
            .await
            .unwrap();
        assert!(exists);
        assert_eq!(selected.name, "pool2");

        let missing = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_MODE, "pool9");
        assert!(h.ctx.select_load_balancer(&missing, &[], &nodes(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_service_load_balancer_found_by_frontend() {
        let h = harness(config());
        let svc = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE);
        let mut existing = lb("kubernetes-internal", 0);
        existing.frontend_ip_configurations.push(FrontendIpConfiguration {
            name: "a1234abcd".into(),
            private_ip_address: Some("10.240.0.4".into()),
            ..Default::default()
        });
        h.cloud.put_load_balancer(RESOURCE_GROUP, existing);

        let found = h
            .ctx
            .get_service_load_balancer(&svc, &nodes(1), true, Vec::new())
            .await
            .unwrap();

        assert!(found.exists);
        assert_eq!(found.lb.name, "kubernetes-internal");
        let status = found.status.unwrap();
        assert_eq!(status.ingress, vec!["10.240.0.4".to_string()]);
        assert_eq!(status.frontends.len(), 1);
    }

    #[tokio::test]
    async fn test_service_load_balancer_defaults_when_absent() {
        let h = harness(standard_config());
        let svc = web_service("web", "1234-abcd");

        let found = h
            .ctx
            .get_service_load_balancer(&svc, &nodes(1), true, Vec::new())
            .await
            .unwrap();

        assert!(!found.exists);
        assert!(found.status.is_none());
        assert_eq!(found.lb.name, "kubernetes");
        assert_eq!(found.lb.sku, Some(LoadBalancerSku::Standard));
        assert_eq!(found.lb.location.as_deref(), Some("eastus"));
    }

    #[tokio::test]
    async fn test_status_includes_additional_public_ips() {
        let h = harness(config());
        let svc = annotate(
            annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE),
            ADDITIONAL_PUBLIC_IPS,
            "1.2.3.4",
        );
        let mut existing = lb("kubernetes-internal", 0);
        existing.frontend_ip_configurations.push(FrontendIpConfiguration {
            name: "a1234abcd".into(),
            private_ip_address: Some("10.240.0.4".into()),
            ..Default::default()
        });
        existing.frontend_ip_configurations.push(FrontendIpConfiguration {
            name: "aother".into(),
            private_ip_address: Some("10.240.0.5".into()),
            ..Default::default()
        });

        let status = h
            .ctx
            .service_load_balancer_status(&svc, &existing)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.ingress, names(&["10.240.0.4", "1.2.3.4"]));
        assert_eq!(status.primary_ips, names(&["10.240.0.4"]));
        assert!(h
            .ctx
            .service_load_balancer_status(&svc, &lb("kubernetes-internal", 0))
            .await
            .unwrap()
            .is_none());
    }
}
