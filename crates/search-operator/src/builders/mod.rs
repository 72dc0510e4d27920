//! Desired-state builders, one per search component. Builders are pure: they
//! map a normalized spec and the owner's identity to child resources and
//! never talk to the cluster.

mod api;
mod collector;
mod common;
mod database;
mod indexer;
mod remote_collector;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ResourceRequirements, ServiceAccount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::BuildError;
use crate::normalize::NormalizedSpec;
use crate::resources::{ManagedResource, object_meta};

pub use collector::validate_filters;

pub const DB_SECRET_NAME: &str = "search-postgres";
pub const COLLECTOR_CONFIG_NAME: &str = "search-collector-config";
pub const SERVICE_ACCOUNT_NAME: &str = "search-serviceaccount";
pub const TLS_MOUNT_PATH: &str = "/sslcert";
pub const READINESS_PATH: &str = "/readiness";
pub const LIVENESS_PATH: &str = "/liveness";

/// Logical search component. Order of [`Component::ALL`] is the apply order:
/// the database comes first because everything else reads its connection
/// details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Database,
    Indexer,
    Collector,
    Api,
    RemoteCollector,
}

/// Fixed probe timings, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub readiness_delay: i32,
    pub readiness_timeout: i32,
    pub liveness_delay: i32,
    pub liveness_timeout: i32,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Database,
        Component::Indexer,
        Component::Collector,
        Component::Api,
        Component::RemoteCollector,
    ];

    /// Name of the workload and service for this component
    pub fn resource_name(self) -> &'static str {
        match self {
            Component::Database => "search-postgres",
            Component::Indexer => "search-indexer",
            Component::Collector => "search-collector",
            Component::Api => "search-api",
            Component::RemoteCollector => "search-remote-collector",
        }
    }

    pub fn tls_secret_name(self) -> &'static str {
        match self {
            Component::Database => "search-postgres-certs",
            Component::Indexer => "search-indexer-certs",
            Component::Collector => "search-collector-certs",
            Component::Api => "search-api-certs",
            Component::RemoteCollector => "search-remote-collector-certs",
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Component::Database => 5432,
            Component::Indexer => 3010,
            Component::Collector | Component::RemoteCollector => 5010,
            Component::Api => 4010,
        }
    }

    pub fn is_stateful(self) -> bool {
        matches!(self, Component::Database)
    }

    pub fn probe_timing(self) -> ProbeTiming {
        match self {
            Component::Database => ProbeTiming {
                readiness_delay: 5,
                readiness_timeout: 1,
                liveness_delay: 120,
                liveness_timeout: 10,
            },
            Component::Indexer => ProbeTiming {
                readiness_delay: 15,
                readiness_timeout: 30,
                liveness_delay: 20,
                liveness_timeout: 30,
            },
            Component::Collector | Component::RemoteCollector => ProbeTiming {
                readiness_delay: 15,
                readiness_timeout: 10,
                liveness_delay: 60,
                liveness_timeout: 10,
            },
            Component::Api => ProbeTiming {
                readiness_delay: 5,
                readiness_timeout: 2,
                liveness_delay: 10,
                liveness_timeout: 5,
            },
        }
    }

    /// Requests applied when the Search leaves `resources` unset.
    pub fn default_resources(self) -> ResourceRequirements {
        let (cpu, memory) = match self {
            Component::Database => ("25m", "1Gi"),
            Component::Indexer => ("20m", "100Mi"),
            Component::Collector | Component::RemoteCollector => ("25m", "128Mi"),
            Component::Api => ("20m", "512Mi"),
        };
        ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.into())),
                ("memory".to_string(), Quantity(memory.into())),
            ])),
            ..Default::default()
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Database => "database",
            Component::Indexer => "indexer",
            Component::Collector => "collector",
            Component::Api => "api",
            Component::RemoteCollector => "remote-collector",
        };
        f.write_str(s)
    }
}

/// Namespace and name of the owning Search resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub namespace: String,
    pub name: String,
}

impl OwnerIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.name.trim().is_empty() {
            return Err(BuildError::MissingIdentity("name"));
        }
        if self.namespace.trim().is_empty() {
            return Err(BuildError::MissingIdentity("namespace"));
        }
        Ok(())
    }
}

/// Desired resources for one component, in the order they must be applied.
/// Disabled components yield nothing.
pub fn build(
    component: Component,
    spec: &NormalizedSpec,
    owner: &OwnerIdentity,
) -> Result<Vec<ManagedResource>, BuildError> {
    owner.validate()?;
    let Some(settings) = spec.settings(component) else {
        return Ok(Vec::new());
    };
    match component {
        Component::Database => database::build(spec, settings, owner),
        Component::Indexer => indexer::build(spec, settings, owner),
        Component::Collector => collector::build(spec, settings, owner),
        Component::Api => api::build(spec, settings, owner),
        Component::RemoteCollector => remote_collector::build(spec, settings, owner),
    }
}

/// Resources shared by every component.
pub fn build_shared(owner: &OwnerIdentity) -> Result<Vec<ManagedResource>, BuildError> {
    owner.validate()?;
    Ok(vec![ManagedResource::ServiceAccount(ServiceAccount {
        metadata: object_meta(SERVICE_ACCOUNT_NAME, &owner.namespace, "search"),
        ..Default::default()
    })])
}
