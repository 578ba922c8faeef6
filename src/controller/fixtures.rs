//! Shared builders for controller tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeStatus, Service, ServicePort, ServiceSpec,
};
use kube::api::ObjectMeta;

use super::context::ReconcileContext;
use super::events::MemoryEventRecorder;
use crate::cloud::memory::{InMemoryCloud, StaticClusterLister};
use crate::cloud::types::{SecurityGroup, Subnet};
use crate::config::CloudConfig;

pub const SUBSCRIPTION: &str = "sub";
pub const RESOURCE_GROUP: &str = "rg";

pub fn config() -> CloudConfig {
    CloudConfig {
        cluster_name: "kubernetes".into(),
        subscription_id: SUBSCRIPTION.into(),
        resource_group: RESOURCE_GROUP.into(),
        location: "eastus".into(),
        vnet_name: "vnet".into(),
        subnet_name: "subnet".into(),
        security_group_name: "nsg".into(),
        route_table_name: "routes".into(),
        ..Default::default()
    }
}

pub fn standard_config() -> CloudConfig {
    CloudConfig {
        load_balancer_sku: "standard".into(),
        ..config()
    }
}

pub fn port(protocol: &str, port: i32, node_port: i32) -> ServicePort {
    ServicePort {
        name: Some(format!("{}-{port}", protocol.to_ascii_lowercase())),
        protocol: Some(protocol.into()),
        port,
        node_port: Some(node_port),
        ..Default::default()
    }
}

/// A `LoadBalancer` service in `default` with an IPv4 cluster IP.
pub fn service(name: &str, uid: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            cluster_ip: Some("10.0.0.10".into()),
            ip_families: Some(vec!["IPv4".into()]),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn web_service(name: &str, uid: &str) -> Service {
    service(name, uid, vec![port("TCP", 80, 30080), port("TCP", 443, 30443)])
}

pub fn annotate(mut svc: Service, key: &str, value: &str) -> Service {
    svc.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
    svc
}

pub fn node(name: &str, ip: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".into(),
                address: ip.into(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn label_node(mut node: Node, key: &str, value: &str) -> Node {
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
    node
}

/// `count` nodes named `node-{i}` with addresses `10.1.0.{i}`.
pub fn nodes(count: usize) -> Vec<Node> {
    (0..count)
        .map(|i| node(&format!("node-{i}"), &format!("10.1.0.{}", i + 10)))
        .collect()
}

pub struct Harness {
    pub cloud: Arc<InMemoryCloud>,
    pub lister: Arc<StaticClusterLister>,
    pub events: Arc<MemoryEventRecorder>,
    pub ctx: Arc<ReconcileContext>,
}

/// A context over an in-memory cloud holding the cluster's subnet and security group.
pub fn harness(config: CloudConfig) -> Harness {
    let cloud = Arc::new(InMemoryCloud::new(SUBSCRIPTION));
    cloud.set_primary_vm_set("agentpool");
    cloud.set_region_zones(&config.location, vec!["1".into(), "2".into(), "3".into()]);
    cloud.put_subnet(
        config.vnet_resource_group(),
        &config.vnet_name,
        Subnet {
            name: config.subnet_name.clone(),
            address_prefix: Some("10.240.0.0/16".into()),
            ..Default::default()
        },
    );
    cloud.put_security_group(
        config.security_group_resource_group(),
        SecurityGroup {
            name: config.security_group_name.clone(),
            location: Some(config.location.clone()),
            ..Default::default()
        },
    );
    let lister = Arc::new(StaticClusterLister::new());
    let events = Arc::new(MemoryEventRecorder::new());
    let ctx = Arc::new(ReconcileContext::new(
        Arc::new(config),
        cloud.clients(),
        lister.clone(),
        events.clone(),
    ));
    Harness {
        cloud,
        lister,
        events,
        ctx,
    }
}
