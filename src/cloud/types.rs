//! Mirror types for the remote network resources.
//!
//! Optional scalars stay `Option` so that "absent" never collides with a zero
//! value; accessors document the default the remote API applies on absence.
//! Collections default to empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Tags = BTreeMap<String, String>;

/// Reference to another resource by ID.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResource {
    pub id: String,
}

impl SubResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Resource IDs compare case-insensitively.
    pub fn same_as(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}

/// Compare two optional references; both absent is equal.
pub fn equal_sub_resource(a: Option<&SubResource>, b: Option<&SubResource>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_as(&b.id),
        _ => false,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadBalancerSku {
    #[default]
    Basic,
    Standard,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    #[default]
    IPv4,
    IPv6,
}

impl IpVersion {
    pub fn from_is_ipv6(is_ipv6: bool) -> Self {
        if is_ipv6 {
            IpVersion::IPv6
        } else {
            IpVersion::IPv4
        }
    }

    pub fn is_ipv6(self) -> bool {
        self == IpVersion::IPv6
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpAllocationMethod {
    Static,
    #[default]
    Dynamic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeProtocol {
    Tcp,
    Http,
    Https,
}

impl ProbeProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(ProbeProtocol::Tcp),
            "http" => Some(ProbeProtocol::Http),
            "https" => Some(ProbeProtocol::Https),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadDistribution {
    #[default]
    Default,
    #[serde(rename = "SourceIP")]
    SourceIp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityRuleProtocol {
    Tcp,
    Udp,
    #[serde(rename = "*")]
    Asterisk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityRuleAccess {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityRuleDirection {
    #[default]
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Absent SKU is Basic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<LoadBalancerSku>,
    #[serde(default)]
    pub frontend_ip_configurations: Vec<FrontendIpConfiguration>,
    #[serde(default)]
    pub load_balancing_rules: Vec<LoadBalancingRule>,
    #[serde(default)]
    pub probes: Vec<Probe>,
    #[serde(default)]
    pub backend_address_pools: Vec<BackendAddressPool>,
    #[serde(default)]
    pub outbound_rules: Vec<OutboundRule>,
    #[serde(default)]
    pub inbound_nat_rules: Vec<InboundNatRule>,
    #[serde(default)]
    pub inbound_nat_pools: Vec<InboundNatPool>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl LoadBalancer {
    pub fn sku(&self) -> LoadBalancerSku {
        self.sku.unwrap_or_default()
    }

    /// Internal load balancers carry the `-internal` name suffix.
    pub fn is_internal(&self) -> bool {
        self.name
            .to_ascii_lowercase()
            .ends_with(crate::controller::naming::INTERNAL_LOAD_BALANCER_NAME_SUFFIX)
    }

    pub fn frontend(&self, name: &str) -> Option<&FrontendIpConfiguration> {
        self.frontend_ip_configurations
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn backend_pool(&self, name: &str) -> Option<&BackendAddressPool> {
        self.backend_address_pools
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendIpConfiguration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,
    /// Absent allocation method is Dynamic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_allocation_method: Option<IpAllocationMethod>,
    /// Absent version is IPv4.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_address_version: Option<IpVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

impl FrontendIpConfiguration {
    pub fn allocation_method(&self) -> IpAllocationMethod {
        self.private_ip_allocation_method.unwrap_or_default()
    }

    pub fn is_internal(&self) -> bool {
        self.public_ip_address.is_none()
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub protocol: TransportProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_ip_configuration: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_address_pool: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<SubResource>,
    pub frontend_port: i32,
    pub backend_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_floating_ip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_tcp_reset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_outbound_snat: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_in_minutes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_distribution: Option<LoadDistribution>,
}

impl LoadBalancingRule {
    /// Structural equality over the fields the reconciler controls.
    ///
    /// TCP reset is compared only for TCP rules; idle timeout only when both
    /// sides set it and a load balancer is wanted.
    pub fn equivalent_to(&self, target: &LoadBalancingRule, want_lb: bool) -> bool {
        if self.protocol != target.protocol {
            return false;
        }
        if self.protocol == TransportProtocol::Tcp
            && self.enable_tcp_reset.unwrap_or(false) != target.enable_tcp_reset.unwrap_or(false)
        {
            return false;
        }
        let same = equal_sub_resource(
            self.frontend_ip_configuration.as_ref(),
            target.frontend_ip_configuration.as_ref(),
        ) && equal_sub_resource(
            self.backend_address_pool.as_ref(),
            target.backend_address_pool.as_ref(),
        ) && self.load_distribution == target.load_distribution
            && self.frontend_port == target.frontend_port
            && self.backend_port == target.backend_port
            && equal_sub_resource(self.probe.as_ref(), target.probe.as_ref())
            && self.enable_floating_ip == target.enable_floating_ip
            && self.disable_outbound_snat.unwrap_or(false)
                == target.disable_outbound_snat.unwrap_or(false);
        if !same {
            return false;
        }
        match (self.idle_timeout_in_minutes, target.idle_timeout_in_minutes) {
            (Some(a), Some(b)) if want_lb => a == b,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub protocol: ProbeProtocol,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_probes: Option<i32>,
}

impl Probe {
    pub fn equivalent_to(&self, other: &Probe) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.protocol == other.protocol
            && self.port == other.port
            && self.request_path == other.request_path
            && self.interval_in_seconds == other.interval_in_seconds
            && self.number_of_probes == other.number_of_probes
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAddressPool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// NIC IP configurations, used by the node-IP-configuration strategy.
    #[serde(default)]
    pub backend_ip_configurations: Vec<SubResource>,
    /// Address entries, used by the node-IP strategy.
    #[serde(default)]
    pub load_balancer_backend_addresses: Vec<BackendAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_network: Option<SubResource>,
}

impl BackendAddressPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_ip_address(&self, ip: &str) -> bool {
        self.load_balancer_backend_addresses
            .iter()
            .any(|a| a.ip_address.as_deref() == Some(ip))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAddress {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_network: Option<SubResource>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRule {
    pub name: String,
    #[serde(default)]
    pub frontend_ip_configurations: Vec<SubResource>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNatRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_ip_configuration: Option<SubResource>,
    pub protocol: TransportProtocol,
    pub frontend_port: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNatPool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_ip_configuration: Option<SubResource>,
    pub protocol: TransportProtocol,
    pub frontend_port_range_start: i32,
    pub frontend_port_range_end: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicIpSku {
    #[default]
    Basic,
    Standard,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpTag {
    pub ip_tag_type: String,
    pub tag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name_label: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIpAddress {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<PublicIpSku>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Absent version is IPv4.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address_version: Option<IpVersion>,
    /// Absent allocation method is Dynamic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_allocation_method: Option<IpAllocationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_settings: Option<DnsSettings>,
    #[serde(default)]
    pub ip_tags: Vec<IpTag>,
    /// Frontend configuration currently bound to this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_configuration: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_prefix: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl PublicIpAddress {
    pub fn version(&self) -> IpVersion {
        self.public_ip_address_version.unwrap_or_default()
    }

    pub fn allocation_method(&self) -> IpAllocationMethod {
        self.public_ip_allocation_method.unwrap_or_default()
    }

    pub fn domain_name_label(&self) -> Option<&str> {
        self.dns_settings
            .as_ref()
            .and_then(|d| d.domain_name_label.as_deref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    pub name: String,
    pub protocol: SecurityRuleProtocol,
    pub source_port_range: String,
    pub destination_port_range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_address_prefix: Option<String>,
    #[serde(default)]
    pub destination_address_prefixes: Vec<String>,
    pub access: SecurityRuleAccess,
    pub priority: i32,
    #[serde(default)]
    pub direction: SecurityRuleDirection,
}

impl SecurityRule {
    /// Every destination prefix, whether held in the singular or the plural field.
    pub fn destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = self.destination_address_prefix.iter().cloned().collect();
        out.extend(self.destination_address_prefixes.iter().cloned());
        out
    }

    pub fn set_destinations(&mut self, mut prefixes: Vec<String>) {
        prefixes.sort();
        prefixes.dedup();
        if prefixes.len() == 1 {
            self.destination_address_prefix = prefixes.pop();
            self.destination_address_prefixes.clear();
        } else {
            self.destination_address_prefix = None;
            self.destination_address_prefixes = prefixes;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_prefix: Option<String>,
    #[serde(default)]
    pub address_prefixes: Vec<String>,
    /// `Enabled` or `Disabled`; absent means enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_link_service_network_policies: Option<String>,
}

impl Subnet {
    pub fn contains_ip(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
            return false;
        };
        self.address_prefix
            .iter()
            .chain(self.address_prefixes.iter())
            .filter_map(|cidr| cidr.parse::<ipnet::IpNet>().ok())
            .any(|net| net.contains(&addr))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    pub address_prefix: String,
    pub next_hop_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_ip_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateLinkService {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub load_balancer_frontend_ip_configurations: Vec<SubResource>,
    #[serde(default)]
    pub ip_configurations: Vec<PlsIpConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_proxy_protocol: Option<bool>,
    #[serde(default)]
    pub fqdns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approval: Option<Vec<String>>,
    #[serde(default)]
    pub private_endpoint_connections: Vec<PrivateEndpointConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlsIpConfiguration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<SubResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_allocation_method: Option<IpAllocationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_address_version: Option<IpVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateEndpointConnection {
    pub name: String,
}
