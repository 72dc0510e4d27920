use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, VolumeMount};

use super::common::{self, literal_env};
use super::{COLLECTOR_CONFIG_NAME, Component, OwnerIdentity};
use crate::crds::search::FilterSpec;
use crate::error::{BuildError, ReconcileError};
use crate::normalize::{ComponentSettings, NormalizedSpec};
use crate::resources::{ManagedResource, object_meta};

pub const FILTER_FILE: &str = "filters.yaml";
const CONFIG_VOLUME: &str = "collector-config";
const CONFIG_PATH: &str = "/etc/search-collector";

const COMPONENT: Component = Component::Collector;

pub fn build(
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    owner: &OwnerIdentity,
) -> Result<Vec<ManagedResource>, BuildError> {
    let filters = serde_yaml::to_string(&spec.filters)
        .map_err(|e| BuildError::Encode(e.to_string()))?;
    let config = ConfigMap {
        metadata: object_meta(
            COLLECTOR_CONFIG_NAME,
            &owner.namespace,
            COMPONENT.resource_name(),
        ),
        data: Some(BTreeMap::from([(FILTER_FILE.to_string(), filters)])),
        ..Default::default()
    };

    let mut container = common::container(COMPONENT, settings);
    container.env = Some(vec![
        literal_env("AGGREGATOR_URL", aggregator_url(&owner.namespace)),
        literal_env("CLUSTER_NAME", "local-cluster"),
        literal_env("DEPLOYED_IN_HUB", "true"),
        literal_env("FILTER_CONFIG", format!("{CONFIG_PATH}/{FILTER_FILE}")),
    ]);
    container.volume_mounts = Some(vec![
        common::tls_mount(),
        VolumeMount {
            name: CONFIG_VOLUME.into(),
            mount_path: CONFIG_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        },
    ]);

    Ok(vec![
        ManagedResource::ConfigMap(config),
        common::service(COMPONENT, owner),
        common::deployment(
            COMPONENT,
            spec,
            settings,
            owner,
            container,
            vec![
                common::tls_volume(COMPONENT),
                common::configmap_volume(CONFIG_VOLUME, COLLECTOR_CONFIG_NAME),
            ],
        ),
    ])
}

/// Where collectors push their data.
pub fn aggregator_url(namespace: &str) -> String {
    let indexer = Component::Indexer;
    format!(
        "https://{}.{}.svc:{}",
        indexer.resource_name(),
        namespace,
        indexer.port()
    )
}

/// Reject allow/deny maps the collector could not interpret.
pub fn validate_filters(filters: &FilterSpec) -> Result<(), ReconcileError> {
    let check = |list: &str, map: &BTreeMap<String, Vec<String>>| {
        for (kind, names) in map {
            if kind.trim().is_empty() || kind.contains(char::is_whitespace) {
                return Err(ReconcileError::Validation(format!(
                    "{list}: invalid resource kind {kind:?}"
                )));
            }
            if names.is_empty() {
                return Err(ReconcileError::Validation(format!(
                    "{list}: {kind} has an empty name list"
                )));
            }
            if let Some(bad) = names
                .iter()
                .find(|n| n.trim().is_empty() || n.contains(char::is_whitespace))
            {
                return Err(ReconcileError::Validation(format!(
                    "{list}: {kind} has invalid entry {bad:?}"
                )));
            }
        }
        Ok(())
    };
    check("allowedResources", &filters.allowed_resources)?;
    check("deniedResources", &filters.denied_resources)?;

    for (kind, allowed) in &filters.allowed_resources {
        if let Some(denied) = filters.denied_resources.get(kind)
            && let Some(both) = allowed.iter().find(|n| denied.contains(n))
        {
            return Err(ReconcileError::Validation(format!(
                "{kind} {both:?} is both allowed and denied"
            )));
        }
    }
    Ok(())
}
