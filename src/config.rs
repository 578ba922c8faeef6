//! Cloud configuration.
//!
//! Loaded from a YAML or TOML file at startup; every field has a default so a
//! minimal file only needs the cluster identity.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

use crate::controller::backend_pool::BackendPoolType;
use crate::error::{Error, Result};

pub const LOAD_BALANCER_SKU_BASIC: &str = "basic";
pub const LOAD_BALANCER_SKU_STANDARD: &str = "standard";

pub const PRE_CONFIGURED_POOL_TYPES_NONE: &str = "";
pub const PRE_CONFIGURED_POOL_TYPES_INTERNAL: &str = "internal";
pub const PRE_CONFIGURED_POOL_TYPES_EXTERNAL: &str = "external";
pub const PRE_CONFIGURED_POOL_TYPES_ALL: &str = "all";

pub const HEALTH_PROBE_MODE_SERVICE_NODE_PORT: &str = "servicenodeport";
pub const HEALTH_PROBE_MODE_SHARED: &str = "shared";

pub const DEFAULT_MAXIMUM_LOAD_BALANCER_RULE_COUNT: usize = 250;
pub const DEFAULT_SHARED_PROBE_PORT: i32 = 10256;
pub const DEFAULT_SHARED_PROBE_PATH: &str = "/healthz";

/// Placement policy for one of several standard load balancers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleStandardLoadBalancerConfiguration {
    pub name: String,
    #[serde(default)]
    pub primary_vm_set: String,
    /// Absent means placement is allowed.
    #[serde(default)]
    pub allow_service_placement: Option<bool>,
    #[serde(default)]
    pub service_label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub service_namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub node_selector: Option<LabelSelector>,
}

impl MultipleStandardLoadBalancerConfiguration {
    pub fn allows_service_placement(&self) -> bool {
        self.allow_service_placement.unwrap_or(true)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheTtls {
    pub load_balancer: u64,
    pub public_ip: u64,
    pub security_group: u64,
    pub route_table: u64,
    pub private_link_service: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            load_balancer: 120,
            public_ip: 120,
            security_group: 120,
            route_table: 120,
            private_link_service: 120,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub cluster_name: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    /// Overrides `resource_group` for load balancers.
    pub load_balancer_resource_group: String,
    pub vnet_name: String,
    pub vnet_resource_group: String,
    pub subnet_name: String,
    pub security_group_name: String,
    pub security_group_resource_group: String,
    pub route_table_name: String,
    pub route_table_resource_group: String,
    pub private_link_service_resource_group: String,

    pub load_balancer_sku: String,
    /// Base name of the cluster's load balancers; defaults to the cluster name.
    pub load_balancer_name: String,
    pub maximum_load_balancer_rule_count: usize,
    pub load_balancer_backend_pool_configuration_type: String,
    pub pre_configured_backend_pool_load_balancer_types: String,
    pub disable_outbound_snat: bool,
    pub multiple_standard_load_balancer_configurations: Vec<MultipleStandardLoadBalancerConfiguration>,

    pub cluster_service_load_balancer_health_probe_mode: String,
    pub cluster_service_shared_load_balancer_health_probe_port: i32,
    pub cluster_service_shared_load_balancer_health_probe_path: String,

    pub primary_vm_set_name: String,
    /// Comma separated `key=value` pairs applied to every managed resource.
    pub tags: String,
    pub tags_map: BTreeMap<String, String>,

    pub cache_ttl_seconds: CacheTtls,
    pub route_update_interval_seconds: u64,
    pub route_queue_capacity: usize,
    /// Route names carry the pod CIDR when the cluster is dual-stack.
    pub ipv6_dual_stack_enabled: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            subscription_id: String::new(),
            resource_group: String::new(),
            location: String::new(),
            load_balancer_resource_group: String::new(),
            vnet_name: String::new(),
            vnet_resource_group: String::new(),
            subnet_name: String::new(),
            security_group_name: String::new(),
            security_group_resource_group: String::new(),
            route_table_name: String::new(),
            route_table_resource_group: String::new(),
            private_link_service_resource_group: String::new(),
            load_balancer_sku: LOAD_BALANCER_SKU_BASIC.to_string(),
            load_balancer_name: String::new(),
            maximum_load_balancer_rule_count: DEFAULT_MAXIMUM_LOAD_BALANCER_RULE_COUNT,
            load_balancer_backend_pool_configuration_type: BackendPoolType::NODE_IP_CONFIGURATION
                .to_string(),
            pre_configured_backend_pool_load_balancer_types: PRE_CONFIGURED_POOL_TYPES_NONE
                .to_string(),
            disable_outbound_snat: false,
            multiple_standard_load_balancer_configurations: Vec::new(),
            cluster_service_load_balancer_health_probe_mode: HEALTH_PROBE_MODE_SERVICE_NODE_PORT
                .to_string(),
            cluster_service_shared_load_balancer_health_probe_port: DEFAULT_SHARED_PROBE_PORT,
            cluster_service_shared_load_balancer_health_probe_path: DEFAULT_SHARED_PROBE_PATH
                .to_string(),
            primary_vm_set_name: String::new(),
            tags: String::new(),
            tags_map: BTreeMap::new(),
            cache_ttl_seconds: CacheTtls::default(),
            route_update_interval_seconds: 30,
            route_queue_capacity: 1024,
            ipv6_dual_stack_enabled: false,
        }
    }
}

impl CloudConfig {
    /// Read a config file, choosing the format by extension (`.toml`, otherwise YAML).
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let config: CloudConfig = if is_toml {
            toml::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::ConfigError("clusterName must not be empty".into()));
        }
        let sku = self.load_balancer_sku.to_ascii_lowercase();
        if sku != LOAD_BALANCER_SKU_BASIC && sku != LOAD_BALANCER_SKU_STANDARD {
            return Err(Error::ConfigError(format!(
                "unsupported loadBalancerSku {:?}",
                self.load_balancer_sku
            )));
        }
        BackendPoolType::parse(&self.load_balancer_backend_pool_configuration_type)?;
        match self
            .pre_configured_backend_pool_load_balancer_types
            .to_ascii_lowercase()
            .as_str()
        {
            PRE_CONFIGURED_POOL_TYPES_NONE
            | PRE_CONFIGURED_POOL_TYPES_INTERNAL
            | PRE_CONFIGURED_POOL_TYPES_EXTERNAL
            | PRE_CONFIGURED_POOL_TYPES_ALL => {}
            other => {
                return Err(Error::ConfigError(format!(
                    "unsupported preConfiguredBackendPoolLoadBalancerTypes {other:?}"
                )))
            }
        }
        let mode = self
            .cluster_service_load_balancer_health_probe_mode
            .to_ascii_lowercase();
        if mode != HEALTH_PROBE_MODE_SERVICE_NODE_PORT && mode != HEALTH_PROBE_MODE_SHARED {
            return Err(Error::ConfigError(format!(
                "unsupported clusterServiceLoadBalancerHealthProbeMode {mode:?}"
            )));
        }
        if !self.multiple_standard_load_balancer_configurations.is_empty() {
            if !self.use_standard_load_balancer() {
                return Err(Error::ConfigError(
                    "multipleStandardLoadBalancerConfigurations requires the standard load balancer sku".into(),
                ));
            }
            let mut seen = std::collections::BTreeSet::new();
            for config in &self.multiple_standard_load_balancer_configurations {
                if !seen.insert(config.name.to_ascii_lowercase()) {
                    return Err(Error::ConfigError(format!(
                        "duplicated multiple standard load balancer configuration {:?}",
                        config.name
                    )));
                }
            }
        }
        if self.route_queue_capacity == 0 {
            return Err(Error::ConfigError("routeQueueCapacity must be positive".into()));
        }
        Ok(())
    }

    pub fn use_standard_load_balancer(&self) -> bool {
        self.load_balancer_sku
            .eq_ignore_ascii_case(LOAD_BALANCER_SKU_STANDARD)
    }

    pub fn use_multiple_standard_load_balancers(&self) -> bool {
        self.use_standard_load_balancer()
            && !self.multiple_standard_load_balancer_configurations.is_empty()
    }

    pub fn use_shared_health_probe(&self) -> bool {
        self.cluster_service_load_balancer_health_probe_mode
            .eq_ignore_ascii_case(HEALTH_PROBE_MODE_SHARED)
    }

    pub fn backend_pool_type(&self) -> BackendPoolType {
        BackendPoolType::parse(&self.load_balancer_backend_pool_configuration_type)
            .unwrap_or_default()
    }

    pub fn load_balancer_resource_group(&self) -> &str {
        non_empty_or(&self.load_balancer_resource_group, &self.resource_group)
    }

    pub fn vnet_resource_group(&self) -> &str {
        non_empty_or(&self.vnet_resource_group, &self.resource_group)
    }

    pub fn security_group_resource_group(&self) -> &str {
        non_empty_or(&self.security_group_resource_group, &self.resource_group)
    }

    pub fn route_table_resource_group(&self) -> &str {
        non_empty_or(&self.route_table_resource_group, &self.resource_group)
    }

    pub fn private_link_service_resource_group(&self) -> &str {
        non_empty_or(&self.private_link_service_resource_group, &self.resource_group)
    }

    /// Base name of the cluster's load balancers.
    pub fn load_balancer_base_name(&self) -> &str {
        non_empty_or(&self.load_balancer_name, &self.cluster_name)
    }

    /// Tags from `tags` overlaid with `tags_map`, keys compared case-insensitively.
    pub fn parsed_tags(&self) -> BTreeMap<String, String> {
        parse_tags(&self.tags, &self.tags_map)
    }

    pub fn cache_ttl(&self, seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// Parse `k1=v1,k2=v2` and overlay `overrides`; later keys replace earlier ones
/// regardless of case.
pub fn parse_tags(tags: &str, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    let pairs = tags
        .split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect::<Vec<_>>();
    let overrides = overrides
        .iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()));
    for (k, v) in pairs.into_iter().chain(overrides) {
        if let Some(existing) = out.keys().find(|e| e.eq_ignore_ascii_case(&k)).cloned() {
            out.remove(&existing);
        }
        out.insert(k, v);
    }
    out
}

/// Merge `wanted` into `current`: add missing keys and update changed values,
/// matching keys case-insensitively. Returns whether anything changed.
pub fn reconcile_tags(
    current: &mut BTreeMap<String, String>,
    wanted: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (k, v) in wanted {
        match current.keys().find(|e| e.eq_ignore_ascii_case(k)).cloned() {
            Some(existing) => {
                if current.get(&existing) != Some(v) {
                    current.insert(existing, v.clone());
                    changed = true;
                }
            }
            None => {
                current.insert(k.clone(), v.clone());
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_defaults_fill_missing_fields() {
        let config: CloudConfig = serde_yaml::from_str(
            "clusterName: prod\nresourceGroup: rg\nloadBalancerSku: standard\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.maximum_load_balancer_rule_count, 250);
        assert_eq!(config.load_balancer_base_name(), "prod");
        assert_eq!(config.load_balancer_resource_group(), "rg");
        assert!(config.use_standard_load_balancer());
        assert!(!config.use_multiple_standard_load_balancers());
        assert_eq!(config.backend_pool_type(), BackendPoolType::NodeIpConfiguration);
    }

    #[test]
    fn toml_file_is_loaded_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.toml");
        std::fs::write(
            &path,
            r#"
clusterName = "edge"
resourceGroup = "rg"
loadBalancerSku = "standard"
loadBalancerBackendPoolConfigurationType = "nodeIP"

[[multipleStandardLoadBalancerConfigurations]]
name = "edge"
primaryVmSet = "pool1"
"#,
        )
        .unwrap();
        let config = CloudConfig::from_file(&path).unwrap();
        assert!(config.use_multiple_standard_load_balancers());
        assert_eq!(config.backend_pool_type(), BackendPoolType::NodeIp);
        assert!(config.multiple_standard_load_balancer_configurations[0].allows_service_placement());
    }

    #[test]
    fn multiple_load_balancers_require_standard_sku() {
        let config = CloudConfig {
            multiple_standard_load_balancer_configurations: vec![
                MultipleStandardLoadBalancerConfiguration {
                    name: "kubernetes".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn tags_are_merged_case_insensitively() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Team".to_string(), "net".to_string());
        let tags = parse_tags("team=infra, env = prod,", &overrides);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("Team").map(String::as_str), Some("net"));
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));

        let mut current = BTreeMap::new();
        current.insert("ENV".to_string(), "prod".to_string());
        assert!(reconcile_tags(&mut current, &tags));
        assert!(!reconcile_tags(&mut current, &tags));
        assert_eq!(current.len(), 2);
    }
}
