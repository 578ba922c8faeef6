#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    use crate::cloud::memory::nic_ip_configuration_id;
    use crate::cloud::types::{BackendAddressPool, LoadBalancer, SubResource};
    use crate::config::{CloudConfig, MultipleStandardLoadBalancerConfiguration};
    use crate::controller::fixtures::*;
    use crate::controller::placement::FAILED_TO_FIND_LOAD_BALANCER_FOR_NODE;
    use crate::controller::rules::{expected_lb_rules, RuleTarget};
    use crate::error::Error;

    fn multi_slb_config() -> CloudConfig {
        let pool_b = LabelSelector {
            match_labels: Some(BTreeMap::from([("pool".to_string(), "b".to_string())])),
            ..Default::default()
        };
        CloudConfig {
            multiple_standard_load_balancer_configurations: vec![
                MultipleStandardLoadBalancerConfiguration {
                    name: "kubernetes".into(),
                    primary_vm_set: "agentpool".into(),
                    ..Default::default()
                },
                MultipleStandardLoadBalancerConfiguration {
                    name: "lb2".into(),
                    primary_vm_set: "pool2".into(),
                    node_selector: Some(pool_b),
                    ..Default::default()
                },
                MultipleStandardLoadBalancerConfiguration {
                    name: "lb3".into(),
                    ..Default::default()
                },
            ],
            ..standard_config()
        }
    }

    fn lb(name: &str) -> LoadBalancer {
        LoadBalancer {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn all_lbs() -> Vec<LoadBalancer> {
        vec![lb("kubernetes"), lb("lb2"), lb("lb3")]
    }

    /// node-0 is in the primary VM set, the others in a set no configuration claims.
    fn cluster(h: &Harness) -> Vec<k8s_openapi::api::core::v1::Node> {
        let mut cluster = nodes(3);
        h.cloud.set_node_vm_set("node-1", "pool3");
        h.cloud.set_node_vm_set("node-2", "pool3");
        cluster[1] = label_node(cluster[1].clone(), "pool", "b");
        cluster
    }

    fn active(h: &Harness, lb_name: &str) -> Vec<String> {
        h.ctx
            .active_nodes_by_load_balancer_name(lb_name)
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_nodes_are_placed_by_vm_set_then_selector_then_load() {
        let h = harness(multi_slb_config());
        let cluster = cluster(&h);

        h.ctx
            .place_nodes(&web_service("web", "1234-abcd"), "", &all_lbs(), &cluster)
            .await
            .unwrap();

        assert_eq!(active(&h, "kubernetes"), vec!["node-0".to_string()]);
        assert_eq!(active(&h, "lb2-internal"), vec!["node-1".to_string()]);
        assert_eq!(active(&h, "lb3"), vec!["node-2".to_string()]);
        assert!(h.events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_only_existing_load_balancers_receive_nodes() {
        let h = harness(multi_slb_config());
        let cluster = cluster(&h);

        h.ctx
            .place_nodes(&web_service("web", "1234-abcd"), "kubernetes", &[], &cluster)
            .await
            .unwrap();

        assert_eq!(
            active(&h, "kubernetes"),
            vec!["node-0".to_string(), "node-2".to_string()]
        );
        // node-1 only matches lb2, which does not exist yet.
        assert!(active(&h, "lb2").is_empty());
        assert!(active(&h, "lb3").is_empty());
        assert_eq!(
            h.events.reasons(),
            vec![FAILED_TO_FIND_LOAD_BALANCER_FOR_NODE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_node_without_load_balancer_raises_event() {
        let h = harness(multi_slb_config());
        let cluster = cluster(&h);

        h.ctx
            .place_nodes(&web_service("web", "1234-abcd"), "", &[], &cluster)
            .await
            .unwrap();

        assert_eq!(
            h.events.reasons(),
            vec![FAILED_TO_FIND_LOAD_BALANCER_FOR_NODE.to_string(); 3]
        );
    }

    #[tokio::test]
    async fn test_deleted_nodes_are_pruned() {
        let h = harness(multi_slb_config());
        let svc = web_service("web", "1234-abcd");
        let cluster = cluster(&h);
        h.ctx.place_nodes(&svc, "", &all_lbs(), &cluster).await.unwrap();

        h.ctx
            .place_nodes(&svc, "", &all_lbs(), &cluster[..2])
            .await
            .unwrap();

        assert!(active(&h, "lb3").is_empty());
        assert_eq!(active(&h, "lb2"), vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn test_single_load_balancer_skips_placement() {
        let h = harness(config());
        h.ctx
            .place_nodes(&web_service("web", "1234-abcd"), "", &[], &nodes(2))
            .await
            .unwrap();
        assert!(active(&h, "kubernetes").is_empty());
        assert!(h.events.reasons().is_empty());
    }

    #[test]
    fn test_service_placement_status() {
        let h = harness(multi_slb_config());

        h.ctx.update_service_placement_status(true, "Default/Web", "lb2-internal");
        assert!(h.ctx.placement.active_services.lock()[1].contains("default/web"));

        h.ctx.update_service_placement_status(false, "default/web", "lb2");
        assert!(h.ctx.placement.active_services.lock()[1].is_empty());

        h.ctx.update_service_placement_status(true, "default/web", "unknown");
        assert!(h
            .ctx
            .placement
            .active_services
            .lock()
            .iter()
            .all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn test_rebuild_requires_cluster_configuration() {
        let mut cfg = multi_slb_config();
        cfg.multiple_standard_load_balancer_configurations.remove(0);
        let h = harness(cfg);

        let err = h
            .ctx
            .rebuild_placement(&web_service("web", "1234-abcd"), &[], &nodes(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConfigError(_)));
        assert!(!h.ctx.placement.is_rebuilt());
    }

    #[tokio::test]
    async fn test_rebuild_restores_services_and_nodes_once() {
        let h = harness(multi_slb_config());
        let svc = web_service("web", "1234-abcd");
        h.lister.upsert_service(svc.clone());
        let cluster = cluster(&h);

        let fip_id = h.ctx.frontend_ip_config_id("lb2", "a1234abcd");
        let pool_id = h.ctx.backend_pool_id("lb2", false);
        let target = RuleTarget {
            lb_name: "lb2",
            frontend_ip_config_id: &fip_id,
            backend_pool_id: &pool_id,
            ipv6: false,
        };
        let mut observed = lb("lb2");
        observed.load_balancing_rules = expected_lb_rules(&h.ctx.config, &svc, &target).unwrap().rules;
        let mut pool = BackendAddressPool::new("kubernetes");
        pool.backend_ip_configurations = vec![SubResource::new(nic_ip_configuration_id(
            SUBSCRIPTION,
            "node-1",
        ))];
        observed.backend_address_pools.push(pool);
        let lbs = vec![lb("kubernetes"), observed, lb("lb3")];

        h.ctx.rebuild_placement(&svc, &lbs, &cluster).await.unwrap();

        assert!(h.ctx.placement.is_rebuilt());
        assert!(h.ctx.placement.active_services.lock()[1].contains("default/web"));
        assert_eq!(active(&h, "lb2"), vec!["node-1".to_string()]);
        assert_eq!(active(&h, "kubernetes"), vec!["node-0".to_string()]);

        // Later calls leave the live sets alone.
        h.ctx.placement.active_services.lock()[1].clear();
        h.ctx.rebuild_placement(&svc, &lbs, &cluster).await.unwrap();
        assert!(h.ctx.placement.active_services.lock()[1].is_empty());
    }
}
