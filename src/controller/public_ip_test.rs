#[cfg(test)]
mod tests {
    use crate::cloud::types::{IpTag, PublicIpAddress};
    use crate::controller::annotations::*;
    use crate::controller::fixtures::*;
    use crate::controller::public_ip::*;
    use crate::error::Error;

    fn pip(name: &str, ip: Option<&str>, services: Option<&str>) -> PublicIpAddress {
        let mut pip = PublicIpAddress {
            name: name.to_string(),
            ip_address: ip.map(str::to_string),
            ..Default::default()
        };
        if let Some(services) = services {
            pip.tags.insert(SERVICE_TAG_KEY.to_string(), services.to_string());
        }
        pip
    }

    #[test]
    fn test_bind_and_unbind_services() {
        let mut p = pip("pip", Some("20.0.0.1"), None);

        assert!(bind_services_to_pip(&mut p, &["default/a".to_string()]));
        assert!(!bind_services_to_pip(&mut p, &["default/a".to_string()]));
        assert!(bind_services_to_pip(&mut p, &["default/b".to_string()]));
        assert_eq!(service_tag(&p), Some("default/a,default/b"));

        unbind_service_from_pip(&mut p, "default/a", false);
        assert_eq!(service_tag(&p), Some("default/b"));
    }

    #[test]
    fn test_service_names_in_tags_ignore_case() {
        let mut p = pip("pip", Some("20.0.0.1"), Some("Default/Svc-A"));

        assert!(!bind_services_to_pip(&mut p, &["default/svc-a".to_string()]));
        assert_eq!(service_tag(&p), Some("Default/Svc-A"));

        let svc = web_service("svc-a", "1234-abcd");
        assert_eq!(service_owns_public_ip(&svc, &p, "kubernetes"), (true, false));
        let pending = pip("pip", None, Some("DEFAULT/SVC-A"));
        assert_eq!(service_owns_public_ip(&svc, &pending, "kubernetes"), (true, false));

        p.tags.insert(SERVICE_USING_DNS_KEY.to_string(), "Default/Svc-A".to_string());
        unbind_service_from_pip(&mut p, "default/svc-a", false);
        assert_eq!(service_tag(&p), Some(""));
        assert_eq!(dns_service_tag(&p), None);
        assert_eq!(service_owns_public_ip(&svc, &p, "kubernetes"), (false, false));
    }

    #[test]
    fn test_unbind_user_assigned_only_drops_dns_owner() {
        let mut p = pip("pip", Some("20.0.0.1"), Some("default/a"));
        p.tags.insert(SERVICE_USING_DNS_KEY.to_string(), "default/a".to_string());

        unbind_service_from_pip(&mut p, "default/a", true);

        assert_eq!(service_tag(&p), Some("default/a"));
        assert_eq!(dns_service_tag(&p), None);
    }

    #[test]
    fn test_legacy_tags_are_read() {
        let mut p = pip("pip", Some("20.0.0.1"), None);
        p.tags.insert(LEGACY_SERVICE_TAG_KEY.to_string(), "default/a".to_string());
        p.tags.insert(LEGACY_CLUSTER_NAME_KEY.to_string(), "kubernetes".to_string());

        assert_eq!(service_tag(&p), Some("default/a"));
        assert_eq!(cluster_tag(&p), Some("kubernetes"));

        bind_services_to_pip(&mut p, &["default/b".to_string()]);
        assert!(!p.tags.contains_key(LEGACY_SERVICE_TAG_KEY));
        assert_eq!(service_tag(&p), Some("default/a,default/b"));
    }

    #[test]
    fn test_service_ownership() {
        let svc = web_service("web", "1234-abcd");

        let tagged = pip("pip", Some("20.0.0.1"), Some("default/other,default/web"));
        assert_eq!(service_owns_public_ip(&svc, &tagged, "kubernetes"), (true, false));

        let mut foreign = tagged.clone();
        foreign.tags.insert(CLUSTER_NAME_KEY.to_string(), "elsewhere".to_string());
        assert_eq!(service_owns_public_ip(&svc, &foreign, "kubernetes"), (false, false));

        let untagged = pip("pip", Some("20.0.0.1"), None);
        assert_eq!(service_owns_public_ip(&svc, &untagged, "kubernetes"), (false, true));
        let selecting = annotate(svc.clone(), LOAD_BALANCER_IPV4, "20.0.0.1");
        assert_eq!(service_owns_public_ip(&selecting, &untagged, "kubernetes"), (true, true));

        let pending = pip("pip", None, Some("default/web"));
        assert_eq!(service_owns_public_ip(&svc, &pending, "kubernetes"), (true, false));
    }

    #[test]
    fn test_release_rules() {
        let single = pip("kubernetes-a1234abcd", Some("20.0.0.1"), Some("default/web"));
        let shared = pip("kubernetes-a1234abcd", Some("20.0.0.1"), Some("default/web,default/b"));
        let empty = pip("kubernetes-a1234abcd", Some("20.0.0.1"), Some(""));

        assert!(!should_release_owned_public_ip(&single, true, false, true, "other", None));
        assert!(!should_release_owned_public_ip(&shared, true, false, false, "other", None));
        assert!(!should_release_owned_public_ip(&single, false, false, false, "", None));
        assert!(should_release_owned_public_ip(&empty, false, false, false, "", None));
        assert!(should_release_owned_public_ip(&single, true, false, false, "other", None));
        assert!(!should_release_owned_public_ip(&single, true, false, false, "kubernetes-a1234abcd", None));

        let tags = vec![IpTag {
            ip_tag_type: "RoutingPreference".into(),
            tag: "Internet".into(),
        }];
        assert!(should_release_owned_public_ip(
            &single,
            true,
            false,
            false,
            "kubernetes-a1234abcd",
            Some(&tags)
        ));
    }

    #[test]
    fn test_dns_label_owned_by_other_service_conflicts() {
        let mut p = pip("pip", Some("20.0.0.1"), Some("default/a"));
        assert!(reconcile_dns_settings(&mut p, "myapp", "default/a", false).unwrap());
        assert_eq!(p.domain_name_label(), Some("myapp"));
        assert_eq!(dns_service_tag(&p), Some("default/a"));
        assert!(!reconcile_dns_settings(&mut p, "MYAPP", "default/a", false).unwrap());

        let err = reconcile_dns_settings(&mut p, "other", "default/b", false).unwrap_err();
        assert!(matches!(err, Error::OwnershipConflict(_)));
    }

    #[tokio::test]
    async fn test_determine_name_from_annotation_and_address() {
        let h = harness(config());
        let svc = web_service("web", "1234-abcd");

        assert_eq!(
            h.ctx.determine_public_ip_name(&svc, false).await.unwrap(),
            ("kubernetes-a1234abcd".to_string(), false)
        );

        let named = annotate(svc.clone(), PIP_NAME, "my-pip");
        assert_eq!(
            h.ctx.determine_public_ip_name(&named, false).await.unwrap(),
            ("my-pip".to_string(), true)
        );

        h.cloud.put_public_ip(RESOURCE_GROUP, pip("static-pip", Some("20.1.1.1"), None));
        let by_ip = annotate(svc.clone(), LOAD_BALANCER_IPV4, "20.1.1.1");
        assert_eq!(
            h.ctx.determine_public_ip_name(&by_ip, false).await.unwrap(),
            ("static-pip".to_string(), false)
        );

        let unknown = annotate(svc, LOAD_BALANCER_IPV4, "20.9.9.9");
        assert!(matches!(
            h.ctx.determine_public_ip_name(&unknown, false).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_managed_public_ip_is_created_then_released() {
        let h = harness(config());
        let svc = web_service("web", "1234-abcd");

        let desired = h.ctx.reconcile_public_ips(&svc, None, true).await.unwrap();
        assert_eq!(desired.len(), 1);
        let created = h.cloud.public_ip(RESOURCE_GROUP, "kubernetes-a1234abcd").unwrap();
        assert_eq!(service_tag(&created), Some("default/web"));
        assert_eq!(cluster_tag(&created), Some("kubernetes"));
        assert!(created.ip_address.is_some());

        let desired = h.ctx.reconcile_public_ips(&svc, None, false).await.unwrap();
        assert!(desired.is_empty());
        assert!(h.cloud.public_ip(RESOURCE_GROUP, "kubernetes-a1234abcd").is_none());
    }

    #[tokio::test]
    async fn test_user_assigned_public_ip_is_never_deleted() {
        let h = harness(config());
        h.cloud.put_public_ip(RESOURCE_GROUP, pip("my-pip", None, None));
        let svc = annotate(web_service("web", "1234-abcd"), PIP_NAME, "my-pip");

        let desired = h.ctx.reconcile_public_ips(&svc, None, true).await.unwrap();
        assert_eq!(desired[0].name, "my-pip");
        assert_eq!(h.cloud.writes_of("PublicIPAddress"), 0);

        h.ctx.reconcile_public_ips(&svc, None, false).await.unwrap();
        let kept = h.cloud.public_ip(RESOURCE_GROUP, "my-pip").unwrap();
        assert_eq!(service_tag(&kept), None);
        assert_eq!(h.cloud.writes_of("DeletePublicIPAddress"), 0);
    }

    #[tokio::test]
    async fn test_missing_named_public_ip_is_not_found() {
        let h = harness(config());
        let svc = annotate(web_service("web", "1234-abcd"), PIP_NAME, "missing");

        let err = h.ctx.reconcile_public_ips(&svc, None, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(h.cloud.write_count(), 0);
    }

    #[tokio::test]
    async fn test_dns_label_is_applied_on_create() {
        let h = harness(config());
        let svc = annotate(web_service("web", "1234-abcd"), DNS_LABEL_NAME, "myapp");

        h.ctx.reconcile_public_ips(&svc, None, true).await.unwrap();

        let created = h.cloud.public_ip(RESOURCE_GROUP, "kubernetes-a1234abcd").unwrap();
        assert_eq!(created.domain_name_label(), Some("myapp"));
        assert_eq!(dns_service_tag(&created), Some("default/web"));
    }

    #[tokio::test]
    async fn test_internal_service_releases_its_public_ip() {
        let h = harness(config());
        let svc = web_service("web", "1234-abcd");
        h.ctx.reconcile_public_ips(&svc, None, true).await.unwrap();

        let internal = annotate(svc, LOAD_BALANCER_INTERNAL, TRUE_VALUE);
        let desired = h.ctx.reconcile_public_ips(&internal, None, true).await.unwrap();

        assert!(desired.is_empty());
        assert!(h.cloud.public_ip(RESOURCE_GROUP, "kubernetes-a1234abcd").is_none());
    }
}
