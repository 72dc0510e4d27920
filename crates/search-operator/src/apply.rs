//! Create-or-update of desired child resources.
//!
//! Each desired resource goes through two states: absent, in which case it
//! is created verbatim, or present, in which case the fields the operator
//! owns are merged into the observed object and written back only if that
//! changed anything. Updates carry the observed `resourceVersion`, so a
//! concurrent writer turns into a [`ReconcileError::Conflict`] instead of a
//! lost update. Fields the operator does not own are never touched.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::builders::Component;
use crate::cluster::ClusterApi;
use crate::crds::search::Search;
use crate::error::{ErrorKind, ReconcileError};
use crate::quantity::{Amount, amount, same_requirements};
use crate::resources::{
    MANAGED_BY, ManagedResource, Readiness, ResourceKind, set_controller_reference,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
    Deleted,
}

/// Result of driving one desired resource towards its target state.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// `None` for resources shared by all components
    pub component: Option<Component>,
    pub kind: ResourceKind,
    pub name: String,
    pub result: Result<ApplyAction, ReconcileError>,
    /// The object as the cluster last reported it
    pub observed: Option<ManagedResource>,
}

impl ApplyOutcome {
    pub fn failed(
        component: Option<Component>,
        kind: ResourceKind,
        name: impl Into<String>,
        err: ReconcileError,
    ) -> Self {
        Self {
            component,
            kind,
            name: name.into(),
            result: Err(err),
            observed: None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.result.as_ref().err().map(ReconcileError::kind)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.result,
            Ok(ApplyAction::Created | ApplyAction::Updated | ApplyAction::Deleted)
        )
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.observed.as_ref().and_then(ManagedResource::readiness)
    }
}

/// Run a cluster call under `deadline`; expiry is a transient error.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| ReconcileError::DeadlineExceeded(deadline))?
}

pub struct DiffApplyEngine<'a> {
    cluster: &'a dyn ClusterApi,
    deadline: Duration,
}

impl<'a> DiffApplyEngine<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, deadline: Duration) -> Self {
        Self { cluster, deadline }
    }

    pub async fn apply(
        &self,
        component: Option<Component>,
        mut desired: ManagedResource,
        owner: &Search,
    ) -> ApplyOutcome {
        let kind = desired.kind();
        let name = desired.name().to_string();
        let namespace = desired.namespace().to_string();
        let outcome = |result: Result<ApplyAction, ReconcileError>,
                       observed: Option<ManagedResource>| ApplyOutcome {
            component,
            kind,
            name: name.clone(),
            result,
            observed,
        };

        if let Err(e) = self.cluster.set_owner(&mut desired, owner) {
            return outcome(Err(e), None);
        }

        let observed = match with_deadline(self.deadline, self.cluster.get(kind, &namespace, &name)).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(%kind, %name, error = %e, "fetch failed");
                return outcome(Err(e), None);
            }
        };

        let Some(observed) = observed else {
            return match with_deadline(self.deadline, self.cluster.create(&desired)).await {
                Ok(created) => {
                    info!(%kind, %name, "created");
                    outcome(Ok(ApplyAction::Created), Some(created))
                }
                Err(e) => {
                    warn!(%kind, %name, error = %e, "create failed");
                    outcome(Err(e), None)
                }
            };
        };

        let merged = match merge_owned(&desired, &observed) {
            Ok(Some(merged)) => merged,
            Ok(None) => {
                debug!(%kind, %name, "up to date");
                return outcome(Ok(ApplyAction::Unchanged), Some(observed));
            }
            Err(e) => {
                warn!(%kind, %name, error = %e, "cannot converge");
                return outcome(Err(e), Some(observed));
            }
        };

        match with_deadline(self.deadline, self.cluster.update(&merged)).await {
            Ok(updated) => {
                info!(%kind, %name, "updated");
                outcome(Ok(ApplyAction::Updated), Some(updated))
            }
            Err(e) => {
                warn!(%kind, %name, error = %e, "update failed");
                outcome(Err(e), Some(observed))
            }
        }
    }

    /// Delete children controlled by `owner` that are no longer desired.
    /// Secrets and service accounts are left alone.
    pub async fn prune(
        &self,
        owner: &Search,
        keep: &BTreeSet<(ResourceKind, String)>,
    ) -> Vec<ApplyOutcome> {
        let namespace = owner.metadata.namespace.clone().unwrap_or_default();
        let owner_uid = owner.metadata.uid.clone().unwrap_or_default();
        let mut outcomes = Vec::new();
        for kind in [
            ResourceKind::Deployment,
            ResourceKind::StatefulSet,
            ResourceKind::Service,
            ResourceKind::ConfigMap,
        ] {
            let listed =
                match with_deadline(self.deadline, self.cluster.list(kind, &namespace)).await {
                    Ok(listed) => listed,
                    Err(e) => {
                        warn!(%kind, error = %e, "list failed, skipping prune");
                        outcomes.push(ApplyOutcome::failed(None, kind, "*", e));
                        continue;
                    }
                };
            for obj in listed {
                let name = obj.name().to_string();
                if keep.contains(&(kind, name.clone())) || !is_controlled_by(&obj, &owner_uid) {
                    continue;
                }
                let result = with_deadline(self.deadline, self.cluster.delete(kind, &namespace, &name))
                    .await
                    .map(|_| ApplyAction::Deleted);
                match &result {
                    Ok(_) => info!(%kind, %name, "pruned"),
                    Err(e) => warn!(%kind, %name, error = %e, "prune failed"),
                }
                outcomes.push(ApplyOutcome {
                    component: None,
                    kind,
                    name,
                    result,
                    observed: None,
                });
            }
        }
        outcomes
    }
}

fn is_controlled_by(obj: &ManagedResource, owner_uid: &str) -> bool {
    let meta = obj.meta();
    let managed = meta
        .labels
        .as_ref()
        .and_then(|l| l.get("app.kubernetes.io/managed-by"))
        .is_some_and(|v| v == MANAGED_BY);
    let owned = meta.owner_references.iter().flatten().any(|r| {
        r.controller == Some(true) && r.uid == owner_uid
    });
    managed && owned && !owner_uid.is_empty()
}

/// Merge the owned fields of `desired` into a copy of `observed`.
/// `Ok(None)` means nothing the operator owns differs.
pub fn merge_owned(
    desired: &ManagedResource,
    observed: &ManagedResource,
) -> Result<Option<ManagedResource>, ReconcileError> {
    let kind = observed.kind();
    let name = observed.name().to_string();
    let immutable = |field: &'static str| ReconcileError::ImmutableField {
        kind: kind.to_string(),
        name: name.clone(),
        field,
    };

    let mut merged = observed.clone();
    merge_meta(merged.meta_mut(), desired.meta());
    for owner in desired.meta().owner_references.iter().flatten() {
        set_controller_reference(&mut merged, owner)?;
    }

    match (&mut merged, desired) {
        (ManagedResource::Deployment(m), ManagedResource::Deployment(d)) => {
            merge_deployment(m, d).map_err(immutable)?
        }
        (ManagedResource::StatefulSet(m), ManagedResource::StatefulSet(d)) => {
            merge_statefulset(m, d).map_err(immutable)?
        }
        (ManagedResource::Service(m), ManagedResource::Service(d)) => merge_service(m, d),
        (ManagedResource::ConfigMap(m), ManagedResource::ConfigMap(d)) => {
            m.data = d.data.clone();
        }
        // Credentials are generated once; rewriting them would rotate a
        // password out from under the running database.
        (ManagedResource::Secret(_), ManagedResource::Secret(_)) => {}
        (ManagedResource::ServiceAccount(_), ManagedResource::ServiceAccount(_)) => {}
        _ => {
            return Err(ReconcileError::FatalConfig(format!(
                "{name}: observed {kind} but desired {}",
                desired.kind()
            )));
        }
    }

    Ok((merged != *observed).then_some(merged))
}

/// Desired labels and annotations win; foreign keys survive.
fn merge_meta(merged: &mut ObjectMeta, desired: &ObjectMeta) {
    merge_map(&mut merged.labels, &desired.labels);
    merge_map(&mut merged.annotations, &desired.annotations);
}

fn merge_map(
    merged: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) {
    let Some(desired) = desired.as_ref().filter(|d| !d.is_empty()) else {
        return;
    };
    let target = merged.get_or_insert_with(BTreeMap::new);
    for (k, v) in desired {
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn merge_deployment(merged: &mut Deployment, desired: &Deployment) -> Result<(), &'static str> {
    let Some(ds) = desired.spec.as_ref() else {
        return Ok(());
    };
    let Some(ms) = merged.spec.as_mut() else {
        merged.spec = Some(ds.clone());
        return Ok(());
    };
    if ms.selector != ds.selector {
        return Err("spec.selector");
    }
    ms.replicas = ds.replicas;
    merge_template(&mut ms.template, &ds.template);
    Ok(())
}

fn merge_statefulset(merged: &mut StatefulSet, desired: &StatefulSet) -> Result<(), &'static str> {
    let Some(ds) = desired.spec.as_ref() else {
        return Ok(());
    };
    let Some(ms) = merged.spec.as_mut() else {
        merged.spec = Some(ds.clone());
        return Ok(());
    };
    if ms.selector != ds.selector {
        return Err("spec.selector");
    }
    if ms.service_name != ds.service_name {
        return Err("spec.serviceName");
    }
    if claim_shape(&ms.volume_claim_templates) != claim_shape(&ds.volume_claim_templates) {
        return Err("spec.volumeClaimTemplates");
    }
    ms.replicas = ds.replicas;
    ms.persistent_volume_claim_retention_policy =
        ds.persistent_volume_claim_retention_policy.clone();
    merge_template(&mut ms.template, &ds.template);
    Ok(())
}

/// The parts of claim templates the operator sets, ignoring server defaults.
fn claim_shape(
    claims: &Option<Vec<PersistentVolumeClaim>>,
) -> Vec<(Option<String>, Option<String>, Option<Amount>)> {
    claims
        .iter()
        .flatten()
        .map(|c| {
            let spec = c.spec.as_ref();
            (
                c.metadata.name.clone(),
                spec.and_then(|s| s.storage_class_name.clone()),
                spec.and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("storage"))
                    .map(amount),
            )
        })
        .collect()
}

fn merge_template(merged: &mut PodTemplateSpec, desired: &PodTemplateSpec) {
    if let Some(dm) = desired.metadata.as_ref() {
        merge_meta(merged.metadata.get_or_insert_with(Default::default), dm);
    }
    let Some(dp) = desired.spec.as_ref() else {
        return;
    };
    let Some(mp) = merged.spec.as_mut() else {
        merged.spec = Some(dp.clone());
        return;
    };
    mp.containers = dp
        .containers
        .iter()
        .map(|dc| match mp.containers.iter().find(|mc| mc.name == dc.name) {
            Some(mc) => merge_container(mc, dc),
            None => dc.clone(),
        })
        .collect();
    mp.volumes = dp.volumes.clone();
    mp.service_account_name = dp.service_account_name.clone();
    mp.node_selector = dp.node_selector.clone();
    mp.image_pull_secrets = dp.image_pull_secrets.clone();
    mp.affinity = dp.affinity.clone();
    mp.topology_spread_constraints = dp.topology_spread_constraints.clone();
}

fn merge_container(observed: &Container, desired: &Container) -> Container {
    let mut c = observed.clone();
    c.image = desired.image.clone();
    if desired.image_pull_policy.is_some() {
        c.image_pull_policy = desired.image_pull_policy.clone();
    }
    c.ports = desired.ports.clone();
    c.env = desired.env.clone();
    if !same_requirements(&c.resources, &desired.resources) {
        c.resources = desired.resources.clone();
    }
    c.readiness_probe = desired.readiness_probe.clone();
    c.liveness_probe = desired.liveness_probe.clone();
    c.volume_mounts = desired.volume_mounts.clone();
    c
}

fn merge_service(merged: &mut Service, desired: &Service) {
    let Some(ds) = desired.spec.as_ref() else {
        return;
    };
    let ms = merged.spec.get_or_insert_with(Default::default);
    ms.selector = ds.selector.clone();
    ms.ports = ds.ports.clone();
}
