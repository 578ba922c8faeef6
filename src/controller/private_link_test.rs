#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;

    use crate::cloud::types::{
        FrontendIpConfiguration, IpAllocationMethod, PrivateLinkService, SubResource,
    };
    use crate::controller::annotations::*;
    use crate::controller::fixtures::*;
    use crate::controller::private_link::*;
    use crate::controller::public_ip::CLUSTER_NAME_KEY;
    use crate::error::Error;

    fn pls_service() -> Service {
        annotate(
            annotate(web_service("web", "1234-abcd"), LOAD_BALANCER_INTERNAL, TRUE_VALUE),
            PLS_CREATION,
            TRUE_VALUE,
        )
    }

    fn frontend(h: &Harness) -> FrontendIpConfiguration {
        FrontendIpConfiguration {
            id: Some(h.ctx.frontend_ip_config_id("kubernetes-internal", "a1234abcd")),
            name: "a1234abcd".into(),
            private_ip_address: Some("10.240.0.4".into()),
            ..Default::default()
        }
    }

    fn existing_pls(fip: &FrontendIpConfiguration, owner: Option<&str>) -> PrivateLinkService {
        let mut pls = PrivateLinkService {
            name: "pls-existing".into(),
            load_balancer_frontend_ip_configurations: vec![SubResource::new(fip.id())],
            ..Default::default()
        };
        if let Some(owner) = owner {
            pls.tags.insert(CLUSTER_NAME_KEY.to_string(), "kubernetes".to_string());
            pls.tags.insert(OWNER_SERVICE_KEY.to_string(), owner.to_string());
        }
        pls
    }

    fn stored(h: &Harness) -> Vec<PrivateLinkService> {
        h.cloud.snapshot().private_link_services.into_values().collect()
    }

    #[test]
    fn test_managed_and_owner_tags() {
        let fip = FrontendIpConfiguration {
            id: Some("fip".into()),
            ..Default::default()
        };
        let owned = existing_pls(&fip, Some("default/web"));
        assert!(is_managed_private_link_service(&owned, "Kubernetes"));
        assert!(!is_managed_private_link_service(&owned, "other"));
        assert_eq!(private_link_service_owner(&owned), Some("default/web"));

        let foreign = existing_pls(&fip, None);
        assert!(!is_managed_private_link_service(&foreign, "kubernetes"));
        assert_eq!(private_link_service_owner(&foreign), None);
    }

    #[test]
    fn test_name_defaults_to_frontend_and_cannot_change() {
        let fip = FrontendIpConfiguration {
            name: "a1234abcd".into(),
            ..Default::default()
        };
        let svc = pls_service();
        assert_eq!(
            private_link_service_name(None, &svc, &fip).unwrap(),
            "pls-a1234abcd"
        );

        let existing = existing_pls(&fip, None);
        assert_eq!(
            private_link_service_name(Some(&existing), &svc, &fip).unwrap(),
            "pls-existing"
        );

        let named = annotate(svc, PLS_NAME, "my-pls");
        assert_eq!(private_link_service_name(None, &named, &fip).unwrap(), "my-pls");
        assert!(matches!(
            private_link_service_name(Some(&existing), &named, &fip),
            Err(Error::ValidationError(_))
        ));
    }

    #[test]
    fn test_ip_configurations_follow_static_addresses() {
        let svc = annotate(
            annotate(pls_service(), PLS_IP_CONFIGURATION_IP_ADDRESS, "10.240.0.20"),
            PLS_IP_CONFIGURATION_IP_ADDRESS_COUNT,
            "2",
        );
        let mut pls = PrivateLinkService {
            name: "pls-a1234abcd".into(),
            ..Default::default()
        };

        assert!(reconcile_ip_configurations(&mut pls, &svc, "subnet", "subnet-id").unwrap());
        assert_eq!(pls.ip_configurations.len(), 2);
        let primary = &pls.ip_configurations[0];
        assert_eq!(primary.private_ip_address.as_deref(), Some("10.240.0.20"));
        assert_eq!(primary.private_ip_allocation_method, Some(IpAllocationMethod::Static));
        assert_eq!(primary.primary, Some(true));
        assert_eq!(pls.ip_configurations[1].primary, Some(false));
        assert!(pls.ip_configurations[1].name.ends_with("-dynamic-0"));

        assert!(!reconcile_ip_configurations(&mut pls, &svc, "subnet", "subnet-id").unwrap());
        assert!(reconcile_ip_configurations(&mut pls, &svc, "subnet", "other-subnet-id").unwrap());
    }

    #[test]
    fn test_more_static_addresses_than_configurations_is_rejected() {
        let svc = annotate(
            pls_service(),
            PLS_IP_CONFIGURATION_IP_ADDRESS,
            "10.240.0.20 10.240.0.21",
        );
        let mut pls = PrivateLinkService::default();
        assert!(matches!(
            reconcile_ip_configurations(&mut pls, &svc, "subnet", "subnet-id"),
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_private_link_service_is_created_once() {
        let h = harness(config());
        let svc = pls_service();
        let fip = frontend(&h);

        h.ctx
            .reconcile_private_link_service(&svc, &fip, true)
            .await
            .unwrap();

        let created = stored(&h);
        assert_eq!(created.len(), 1);
        let pls = &created[0];
        assert_eq!(pls.name, "pls-a1234abcd");
        assert_eq!(private_link_service_owner(pls), Some("default/web"));
        assert!(is_managed_private_link_service(pls, "kubernetes"));
        assert_eq!(pls.ip_configurations.len(), 1);
        assert_eq!(pls.ip_configurations[0].primary, Some(true));
        let subnet = &h.cloud.snapshot().subnets["rg/vnet/subnet"];
        assert_eq!(
            subnet.private_link_service_network_policies.as_deref(),
            Some(NETWORK_POLICIES_DISABLED)
        );

        let writes = h.cloud.write_count();
        h.ctx
            .reconcile_private_link_service(&svc, &fip, true)
            .await
            .unwrap();
        assert_eq!(h.cloud.write_count(), writes);
    }

    #[tokio::test]
    async fn test_private_link_service_is_deleted_with_the_frontend() {
        let h = harness(config());
        let svc = pls_service();
        let fip = frontend(&h);
        h.ctx
            .reconcile_private_link_service(&svc, &fip, true)
            .await
            .unwrap();

        h.ctx
            .reconcile_private_link_service(&svc, &fip, false)
            .await
            .unwrap();

        assert!(stored(&h).is_empty());
        assert_eq!(h.cloud.writes_of("DeletePrivateLinkService"), 1);
    }

    #[tokio::test]
    async fn test_external_service_needs_floating_ip_disabled() {
        let h = harness(config());
        let svc = annotate(web_service("web", "1234-abcd"), PLS_CREATION, TRUE_VALUE);
        let fip = FrontendIpConfiguration {
            id: Some(h.ctx.frontend_ip_config_id("kubernetes", "a1234abcd")),
            name: "a1234abcd".into(),
            ..Default::default()
        };

        let err = h
            .ctx
            .reconcile_private_link_service(&svc, &fip, true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ValidationError(_)));
        assert_eq!(h.cloud.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unmanaged_private_link_service_conflicts() {
        let h = harness(config());
        let fip = frontend(&h);
        h.cloud
            .put_private_link_service(RESOURCE_GROUP, existing_pls(&fip, None));

        let err = h
            .ctx
            .reconcile_private_link_service(&pls_service(), &fip, true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::OwnershipConflict(_)));
    }

    #[tokio::test]
    async fn test_private_link_service_of_another_service_is_shared() {
        let h = harness(config());
        let fip = frontend(&h);
        h.cloud.put_private_link_service(
            RESOURCE_GROUP,
            existing_pls(&fip, Some("default/other")),
        );

        h.ctx
            .reconcile_private_link_service(&pls_service(), &fip, true)
            .await
            .unwrap();
        assert_eq!(h.cloud.write_count(), 0);

        let configured = annotate(pls_service(), PLS_FQDNS, "web.example.com");
        let err = h
            .ctx
            .reconcile_private_link_service(&configured, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnershipConflict(_)));
    }
}
