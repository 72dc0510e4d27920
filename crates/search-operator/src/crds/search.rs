use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "search.operator.dev/v1alpha1";
pub const KIND: &str = "Search";

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "search.operator.dev",
    version = "v1alpha1",
    kind = "Search",
    plural = "searches",
    namespaced,
    status = "SearchStatus",
    shortname = "srch"
)]
#[serde(rename_all = "camelCase")]
pub struct SearchSpec {
    /// Secret holding connection details of a user provided database.
    /// When set, the built-in database is not deployed.
    pub custom_db_config: Option<String>,
    /// Storage used by the built-in database
    #[serde(default)]
    pub db_storage: StorageSpec,
    /// ConfigMap with parameters overriding the default database configuration
    pub db_config: Option<String>,
    /// Per-component workload customisation
    #[serde(default)]
    pub deployments: SearchDeployments,
    /// Run stateless components with more than one replica spread across nodes
    #[serde(default, rename = "enableHA")]
    pub enable_ha: bool,
    /// Kubernetes resources the collector is allowed or denied to index
    #[serde(default)]
    pub allow_deny_resources: FilterSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchDeployments {
    #[serde(default)]
    pub database: DeploymentConfig,
    #[serde(default)]
    pub indexer: DeploymentConfig,
    #[serde(default)]
    pub collector: DeploymentConfig,
    #[serde(default)]
    pub api: DeploymentConfig,
    /// Only deployed when present
    pub remote_collector: Option<DeploymentConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Number of pod instances
    pub replica_count: Option<i32>,
    /// Compute resources required by the workload
    pub resources: Option<ResourceRequirements>,
    pub image_override: Option<String>,
    pub image_pull_secret: Option<String>,
    /// Always, IfNotPresent or Never
    pub image_pull_policy: Option<String>,
    /// Schedule on nodes with matching labels
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Proxy settings, honoured by the remote collector
    #[serde(default)]
    pub proxy_config: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub storage_class_name: Option<String>,
    /// Storage capacity, e.g. "10Gi"
    pub size: Option<Quantity>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    /// Resource kind to allowed names or patterns
    #[serde(default)]
    pub allowed_resources: BTreeMap<String, Vec<String>>,
    /// Resource kind to denied names or patterns
    #[serde(default)]
    pub denied_resources: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchStatus {
    /// Human readable health state
    pub search_health: Option<String>,
    /// Database used by search
    pub db_in_use: Option<String>,
    /// Storage used by the database
    pub storage_in_use: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// RFC 3339 timestamp of the last status change
    pub last_transition_time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl SearchStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_wire_names() {
        let spec: SearchSpec = serde_json::from_value(serde_json::json!({
            "customDbConfig": "my-db",
            "enableHA": true,
            "dbStorage": { "storageClassName": "gp3", "size": "20Gi" },
            "deployments": {
                "indexer": { "replicaCount": 3, "nodeSelector": { "zone": "a" } },
                "remoteCollector": { "proxyConfig": { "HTTP_PROXY": "http://proxy:3128" } }
            },
            "allowDenyResources": { "deniedResources": { "Secret": ["*"] } }
        }))
        .unwrap();
        assert_eq!(spec.custom_db_config.as_deref(), Some("my-db"));
        assert!(spec.enable_ha);
        assert_eq!(spec.db_storage.size, Some(Quantity("20Gi".into())));
        assert_eq!(spec.deployments.indexer.replica_count, Some(3));
        assert!(spec.deployments.remote_collector.is_some());
        assert_eq!(
            spec.allow_deny_resources.denied_resources["Secret"],
            vec!["*".to_string()]
        );
    }

    #[test]
    fn empty_spec_is_accepted() {
        let spec: SearchSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec, SearchSpec::default());
    }

    #[test]
    fn condition_serializes_type_field() {
        let c = Condition {
            type_: ConditionType::Degraded,
            status: ConditionStatus::True,
            last_transition_time: "2024-01-01T00:00:00Z".into(),
            reason: "Conflict".into(),
            message: "m".into(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Degraded");
        assert_eq!(v["status"], "True");
        assert_eq!(v["lastTransitionTime"], "2024-01-01T00:00:00Z");
    }
}
