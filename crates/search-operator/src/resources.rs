//! The closed set of child resource kinds the operator manages, plus owner
//! linkage and labelling shared by every builder.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crds::search::{API_VERSION, KIND, Search};
use crate::error::ReconcileError;

pub const MANAGED_BY: &str = "search-operator";
pub const PART_OF: &str = "search";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ServiceAccount,
    Secret,
    ConfigMap,
    Service,
    StatefulSet,
    Deployment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Service => "Service",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Deployment => "Deployment",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagedResource {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
    ServiceAccount(ServiceAccount),
}

/// Replica readiness of a workload as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub desired: i32,
    pub available: i32,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.available >= self.desired
    }
}

impl ManagedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::Deployment(_) => ResourceKind::Deployment,
            ManagedResource::StatefulSet(_) => ResourceKind::StatefulSet,
            ManagedResource::Service(_) => ResourceKind::Service,
            ManagedResource::Secret(_) => ResourceKind::Secret,
            ManagedResource::ConfigMap(_) => ResourceKind::ConfigMap,
            ManagedResource::ServiceAccount(_) => ResourceKind::ServiceAccount,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedResource::Deployment(o) => o.meta(),
            ManagedResource::StatefulSet(o) => o.meta(),
            ManagedResource::Service(o) => o.meta(),
            ManagedResource::Secret(o) => o.meta(),
            ManagedResource::ConfigMap(o) => o.meta(),
            ManagedResource::ServiceAccount(o) => o.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedResource::Deployment(o) => o.meta_mut(),
            ManagedResource::StatefulSet(o) => o.meta_mut(),
            ManagedResource::Service(o) => o.meta_mut(),
            ManagedResource::Secret(o) => o.meta_mut(),
            ManagedResource::ConfigMap(o) => o.meta_mut(),
            ManagedResource::ServiceAccount(o) => o.meta_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// Workload readiness; `None` for non-workload kinds.
    pub fn readiness(&self) -> Option<Readiness> {
        match self {
            ManagedResource::Deployment(d) => {
                let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let available = d
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0);
                Some(Readiness { desired, available })
            }
            ManagedResource::StatefulSet(s) => {
                let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let available = s
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas.or(s.ready_replicas))
                    .unwrap_or(0);
                Some(Readiness { desired, available })
            }
            _ => None,
        }
    }
}

/// Controller owner reference pointing at the Search resource.
pub fn owner_reference(search: &Search) -> Result<OwnerReference, ReconcileError> {
    let uid = search
        .uid()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            ReconcileError::FatalConfig(format!(
                "Search {} has no uid, cannot own children",
                search.name_any()
            ))
        })?;
    Ok(OwnerReference {
        api_version: API_VERSION.into(),
        kind: KIND.into(),
        name: search.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Record `owner` as the controlling owner of `child`. A child already
/// controlled by a different object is refused.
pub fn set_controller_reference(
    child: &mut ManagedResource,
    owner: &OwnerReference,
) -> Result<(), ReconcileError> {
    let kind = child.kind();
    let name = child.name().to_string();
    let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(ReconcileError::FatalConfig(format!(
            "{kind} {name} is already controlled by {} {}",
            other.kind, other.name
        )));
    }
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner.clone());
    Ok(())
}

/// Labels used in selectors. Never change these for an existing component:
/// workload selectors are immutable.
pub fn selector_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), PART_OF.to_string()),
        ("component".to_string(), component.to_string()),
    ])
}

pub fn standard_labels(component: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(component);
    labels.insert("app.kubernetes.io/name".into(), component.into());
    labels.insert("app.kubernetes.io/part-of".into(), PART_OF.into());
    labels.insert("app.kubernetes.io/managed-by".into(), MANAGED_BY.into());
    labels
}

pub fn object_meta(name: &str, namespace: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(standard_labels(component)),
        ..Default::default()
    }
}
