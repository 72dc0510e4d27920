//! Fills policy defaults into a partially populated [`SearchSpec`] so the
//! builders never have to deal with missing values.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::builders::{Component, DB_SECRET_NAME};
use crate::config::OperatorConfig;
use crate::crds::search::{DeploymentConfig, FilterSpec, SearchSpec};
use crate::quantity::{canonical, canonical_requirements};

pub const DEFAULT_REPLICAS: i32 = 1;
pub const HA_REPLICAS: i32 = 2;
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSettings {
    pub replicas: i32,
    pub image: String,
    pub image_pull_policy: String,
    pub image_pull_secret: Option<String>,
    pub resources: ResourceRequirements,
    pub node_selector: BTreeMap<String, String>,
    pub proxy_config: BTreeMap<String, String>,
}

/// Where the dependents get their database from.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseSource {
    BuiltIn {
        storage_class: Option<String>,
        size: Quantity,
        db_config: Option<String>,
    },
    External {
        secret: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSpec {
    pub ha: bool,
    pub database: ComponentSettings,
    pub indexer: ComponentSettings,
    pub collector: ComponentSettings,
    pub api: ComponentSettings,
    pub remote_collector: Option<ComponentSettings>,
    pub db: DatabaseSource,
    pub filters: FilterSpec,
}

impl NormalizedSpec {
    pub fn settings(&self, component: Component) -> Option<&ComponentSettings> {
        match component {
            Component::Database => match self.db {
                DatabaseSource::BuiltIn { .. } => Some(&self.database),
                DatabaseSource::External { .. } => None,
            },
            Component::Indexer => Some(&self.indexer),
            Component::Collector => Some(&self.collector),
            Component::Api => Some(&self.api),
            Component::RemoteCollector => self.remote_collector.as_ref(),
        }
    }

    /// Enabled components in apply order.
    pub fn enabled_components(&self) -> Vec<Component> {
        Component::ALL
            .into_iter()
            .filter(|c| self.settings(*c).is_some())
            .collect()
    }

    /// Secret the dependents read database connection details from
    pub fn db_secret_name(&self) -> &str {
        match &self.db {
            DatabaseSource::BuiltIn { .. } => DB_SECRET_NAME,
            DatabaseSource::External { secret } => secret,
        }
    }
}

pub fn normalize(spec: &SearchSpec, config: &OperatorConfig) -> NormalizedSpec {
    let ha = spec.enable_ha;
    let deployments = &spec.deployments;
    let settings = |component, raw: &DeploymentConfig| component_settings(component, raw, ha, config);

    let db = match spec.custom_db_config.as_deref().map(str::trim) {
        Some(secret) if !secret.is_empty() => DatabaseSource::External {
            secret: secret.to_string(),
        },
        _ => DatabaseSource::BuiltIn {
            storage_class: spec
                .db_storage
                .storage_class_name
                .clone()
                .filter(|s| !s.is_empty()),
            size: spec
                .db_storage
                .size
                .clone()
                .filter(|q| !q.0.is_empty())
                .map(|q| canonical(&q))
                .unwrap_or_else(|| Quantity(DEFAULT_STORAGE_SIZE.into())),
            db_config: spec.db_config.clone().filter(|s| !s.is_empty()),
        },
    };

    NormalizedSpec {
        ha,
        database: settings(Component::Database, &deployments.database),
        indexer: settings(Component::Indexer, &deployments.indexer),
        collector: settings(Component::Collector, &deployments.collector),
        api: settings(Component::Api, &deployments.api),
        remote_collector: deployments
            .remote_collector
            .as_ref()
            .map(|raw| settings(Component::RemoteCollector, raw)),
        db,
        filters: spec.allow_deny_resources.clone(),
    }
}

fn component_settings(
    component: Component,
    raw: &DeploymentConfig,
    ha: bool,
    config: &OperatorConfig,
) -> ComponentSettings {
    let default_replicas = if ha && !component.is_stateful() {
        HA_REPLICAS
    } else {
        DEFAULT_REPLICAS
    };
    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

    ComponentSettings {
        replicas: raw
            .replica_count
            .filter(|r| *r > 0)
            .unwrap_or(default_replicas),
        image: non_empty(&raw.image_override)
            .unwrap_or_else(|| config.images.for_component(component).to_string()),
        image_pull_policy: non_empty(&raw.image_pull_policy)
            .unwrap_or_else(|| DEFAULT_PULL_POLICY.into()),
        image_pull_secret: non_empty(&raw.image_pull_secret),
        resources: canonical_requirements(
            raw.resources
                .clone()
                .unwrap_or_else(|| component.default_resources()),
        ),
        node_selector: raw.node_selector.clone(),
        proxy_config: raw.proxy_config.clone(),
    }
}
