#[cfg(test)]
mod tests {
    use crate::cloud::types::PublicIpAddress;
    use crate::controller::annotations::{LOAD_BALANCER_INTERNAL, TRUE_VALUE};
    use crate::controller::fixtures::*;
    use crate::controller::orchestrator::LoadBalancerReconciler;
    use crate::controller::public_ip::{parse_service_tag, service_tag};
    use crate::controller::service;

    fn reconciler(h: &Harness) -> LoadBalancerReconciler {
        LoadBalancerReconciler::new(h.ctx.clone()).0
    }

    fn public_ips(h: &Harness) -> Vec<PublicIpAddress> {
        h.cloud.snapshot().public_ips.into_values().collect()
    }

    #[tokio::test]
    async fn new_service_gets_rules_probes_pool_and_public_frontend() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");

        let status = r.ensure_load_balancer(&svc, &nodes(3)).await.unwrap();

        let lb = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        assert_eq!(lb.load_balancing_rules.len(), 2);
        assert_eq!(lb.probes.len(), 2);
        assert_eq!(lb.backend_address_pools.len(), 1);
        assert_eq!(lb.backend_address_pools[0].backend_ip_configurations.len(), 3);
        assert_eq!(lb.frontend_ip_configurations.len(), 1);
        let frontend = &lb.frontend_ip_configurations[0];
        assert!(frontend.public_ip_address.is_some());

        let pips = public_ips(&h);
        assert_eq!(pips.len(), 1);
        let ingress = status.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].ip, pips[0].ip_address);
        assert_eq!(
            pips[0].ip_configuration.as_ref().map(|c| c.id.clone()),
            frontend.id.clone()
        );
    }

    #[tokio::test]
    async fn second_ensure_without_changes_writes_nothing() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");
        let nodes = nodes(3);

        let first = r.ensure_load_balancer(&svc, &nodes).await.unwrap();
        let writes = h.cloud.write_count();
        let second = r.ensure_load_balancer(&svc, &nodes).await.unwrap();

        assert_eq!(h.cloud.write_count(), writes);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn scaling_nodes_only_changes_pool_membership() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");
        r.ensure_load_balancer(&svc, &nodes(3)).await.unwrap();
        let before = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        let lb_writes = h.cloud.writes_of("LoadBalancer");

        r.ensure_load_balancer(&svc, &nodes(5)).await.unwrap();

        let after = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        assert_eq!(h.cloud.writes_of("LoadBalancer"), lb_writes);
        assert_eq!(after.load_balancing_rules, before.load_balancing_rules);
        assert_eq!(after.probes, before.probes);
        assert_eq!(after.frontend_ip_configurations, before.frontend_ip_configurations);
        assert_eq!(after.backend_address_pools[0].backend_ip_configurations.len(), 5);
    }

    #[tokio::test]
    async fn switching_internal_to_external_moves_the_frontend() {
        let h = harness(config());
        let r = reconciler(&h);
        let nodes = nodes(2);
        let internal = annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE);

        r.ensure_load_balancer(&internal, &nodes).await.unwrap();
        let ilb = h
            .cloud
            .load_balancer(RESOURCE_GROUP, "kubernetes-internal")
            .unwrap();
        let private_ip = ilb.frontend_ip_configurations[0]
            .private_ip_address
            .clone()
            .unwrap();
        assert!(public_ips(&h).is_empty());

        let external = web_service("web", "1234-abcd");
        let status = r.ensure_load_balancer(&external, &nodes).await.unwrap();

        assert!(h
            .cloud
            .load_balancer(RESOURCE_GROUP, "kubernetes-internal")
            .is_none());
        let lb = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        assert_eq!(lb.frontend_ip_configurations.len(), 1);
        assert_eq!(lb.load_balancing_rules.len(), 2);

        let public_ip = status.ingress.unwrap()[0].ip.clone().unwrap();
        assert_ne!(public_ip, private_ip);
        let sg = h.cloud.security_group(RESOURCE_GROUP, "nsg").unwrap();
        let destinations: Vec<String> = sg
            .security_rules
            .iter()
            .flat_map(|r| r.destinations())
            .collect();
        assert!(destinations.contains(&public_ip));
        assert!(!destinations.contains(&private_ip));
    }

    #[tokio::test]
    async fn shared_public_ip_survives_deleting_one_owner() {
        let h = harness(config());
        let r = reconciler(&h);
        let nodes = nodes(2);
        let a = web_service("a", "aaaa-1111");
        let status = r.ensure_load_balancer(&a, &nodes).await.unwrap();
        let ip = status.ingress.unwrap()[0].ip.clone().unwrap();

        let mut b = service("b", "bbbb-2222", vec![port("TCP", 8080, 31080)]);
        service::set_load_balancer_ip(&mut b, &ip);
        let status_b = r.ensure_load_balancer(&b, &nodes).await.unwrap();
        assert_eq!(status_b.ingress.unwrap()[0].ip.as_deref(), Some(ip.as_str()));

        let pips = public_ips(&h);
        assert_eq!(pips.len(), 1);
        let owners = parse_service_tag(service_tag(&pips[0]).unwrap());
        assert!(owners.contains(&service::service_name(&a)));
        assert!(owners.contains(&service::service_name(&b)));

        r.ensure_load_balancer_deleted(&a).await.unwrap();

        let pips = public_ips(&h);
        assert_eq!(pips.len(), 1);
        assert_eq!(
            parse_service_tag(service_tag(&pips[0]).unwrap()),
            vec![service::service_name(&b)]
        );
        let lb = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        assert_eq!(lb.frontend_ip_configurations.len(), 1);
        assert_eq!(lb.load_balancing_rules.len(), 1);
        assert_eq!(lb.load_balancing_rules[0].frontend_port, 8080);
    }

    #[tokio::test]
    async fn deleting_a_service_that_never_had_resources_writes_nothing() {
        let h = harness(config());
        let r = reconciler(&h);

        r.ensure_load_balancer_deleted(&web_service("web", "1234-abcd"))
            .await
            .unwrap();

        assert_eq!(h.cloud.write_count(), 0);
    }

    #[tokio::test]
    async fn deleting_after_load_balancer_was_removed_out_of_band_succeeds() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");
        r.ensure_load_balancer(&svc, &nodes(2)).await.unwrap();
        h.cloud.remove_load_balancer(RESOURCE_GROUP, "kubernetes");
        h.ctx.store.invalidate_load_balancer("kubernetes");

        r.ensure_load_balancer_deleted(&svc).await.unwrap();

        assert!(h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").is_none());
        assert!(public_ips(&h).is_empty());
    }

    #[tokio::test]
    async fn deleting_the_only_service_removes_its_load_balancer_and_rules() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");
        r.ensure_load_balancer(&svc, &nodes(2)).await.unwrap();

        r.ensure_load_balancer_deleted(&svc).await.unwrap();

        assert!(h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").is_none());
        assert!(public_ips(&h).is_empty());
        let sg = h.cloud.security_group(RESOURCE_GROUP, "nsg").unwrap();
        assert!(sg.security_rules.is_empty());
    }

    #[tokio::test]
    async fn get_load_balancer_reports_existence() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");

        let (status, exists) = r.get_load_balancer(&svc).await.unwrap();
        assert!(status.is_none());
        assert!(!exists);

        let ensured = r.ensure_load_balancer(&svc, &nodes(1)).await.unwrap();
        let (status, exists) = r.get_load_balancer(&svc).await.unwrap();
        assert!(exists);
        assert_eq!(status, Some(ensured));
    }

    #[tokio::test]
    async fn update_is_a_no_op_for_unknown_or_unplaced_services() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");

        r.update_load_balancer(&svc, &nodes(2)).await.unwrap();
        h.lister.upsert_service(svc.clone());
        r.update_load_balancer(&svc, &nodes(2)).await.unwrap();

        assert_eq!(h.cloud.write_count(), 0);
    }

    #[tokio::test]
    async fn update_refreshes_pool_membership() {
        let h = harness(config());
        let r = reconciler(&h);
        let svc = web_service("web", "1234-abcd");
        h.lister.upsert_service(svc.clone());
        r.ensure_load_balancer(&svc, &nodes(2)).await.unwrap();

        r.update_load_balancer(&svc, &nodes(4)).await.unwrap();

        let lb = h.cloud.load_balancer(RESOURCE_GROUP, "kubernetes").unwrap();
        assert_eq!(lb.backend_address_pools[0].backend_ip_configurations.len(), 4);
    }
}
