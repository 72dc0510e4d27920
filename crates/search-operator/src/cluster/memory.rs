//! In-memory [`ClusterApi`] used by unit and integration tests. It mimics
//! the API server behaviours the reconciler depends on: resourceVersion
//! checks on update, `AlreadyExists` on create, `stringData` folding for
//! secrets, and status being ignored by plain updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};

use super::ClusterApi;
use crate::crds::search::{Search, SearchStatus};
use crate::error::ReconcileError;
use crate::quantity::{canonical, canonical_requirements};
use crate::resources::{ManagedResource, ResourceKind};

type Key = (ResourceKind, String, String);

/// Number of calls of each kind seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub status_writes: usize,
}

impl CallCounts {
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct State {
    searches: BTreeMap<(String, String), Search>,
    objects: BTreeMap<Key, ManagedResource>,
    next_version: u64,
    calls: CallCounts,
    pending_conflicts: BTreeSet<(ResourceKind, String)>,
    failing_gets: BTreeMap<(ResourceKind, String), String>,
    status_write_failure: Option<String>,
    search_list_failure: Option<String>,
    latency: Option<Duration>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a Search, assigning uid and resourceVersion when missing.
    pub fn insert_search(&self, mut search: Search) {
        let mut st = self.state();
        let ns = search.metadata.namespace.clone().unwrap_or_default();
        let name = search.metadata.name.clone().unwrap_or_default();
        if search.metadata.uid.is_none() {
            search.metadata.uid = Some(format!("uid-{ns}-{name}"));
        }
        search.metadata.resource_version = Some(st.bump());
        st.searches.insert((ns, name), search);
    }

    pub fn search(&self, namespace: &str, name: &str) -> Option<Search> {
        self.state()
            .searches
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove_search(&self, namespace: &str, name: &str) {
        self.state()
            .searches
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ManagedResource> {
        self.state()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self) -> Vec<ManagedResource> {
        self.state().objects.values().cloned().collect()
    }

    /// Simulate an out-of-band write by another actor.
    pub fn put(&self, mut resource: ManagedResource) {
        let mut st = self.state();
        let version = st.bump();
        resource.meta_mut().resource_version = Some(version);
        st.objects.insert(key_of(&resource), resource);
    }

    /// Simulate an out-of-band delete.
    pub fn remove(&self, kind: ResourceKind, namespace: &str, name: &str) {
        self.state()
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// The next create or update of this object fails with a conflict.
    pub fn inject_conflict(&self, kind: ResourceKind, name: &str) {
        self.state().pending_conflicts.insert((kind, name.to_string()));
    }

    /// Every get of this object fails with a transient error until cleared.
    pub fn fail_gets(&self, kind: ResourceKind, name: &str, message: &str) {
        self.state()
            .failing_gets
            .insert((kind, name.to_string()), message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut st = self.state();
        st.failing_gets.clear();
        st.pending_conflicts.clear();
        st.status_write_failure = None;
        st.search_list_failure = None;
    }

    pub fn fail_status_writes(&self, message: &str) {
        self.state().status_write_failure = Some(message.to_string());
    }

    pub fn fail_search_lists(&self, message: &str) {
        self.state().search_list_failure = Some(message.to_string());
    }

    /// Delay every call, to exercise call deadlines.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Report every workload as fully rolled out, like a healthy cluster.
    pub fn mark_all_available(&self) {
        let mut st = self.state();
        for obj in st.objects.values_mut() {
            set_available(obj, None);
        }
    }

    /// Report `available` replicas for one workload.
    pub fn set_available(&self, kind: ResourceKind, namespace: &str, name: &str, available: i32) {
        let mut st = self.state();
        if let Some(obj) = st
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            set_available(obj, Some(available));
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    pub fn reset_calls(&self) {
        self.state().calls = CallCounts::default();
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

fn key_of(resource: &ManagedResource) -> Key {
    (
        resource.kind(),
        resource.namespace().to_string(),
        resource.name().to_string(),
    )
}

fn set_available(obj: &mut ManagedResource, available: Option<i32>) {
    match obj {
        ManagedResource::Deployment(d) => {
            let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let n = available.unwrap_or(want);
            let status = d.status.get_or_insert_with(Default::default);
            status.replicas = Some(n);
            status.ready_replicas = Some(n);
            status.available_replicas = Some(n);
        }
        ManagedResource::StatefulSet(s) => {
            let want = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let n = available.unwrap_or(want);
            let status = s.status.get_or_insert_with(Default::default);
            status.replicas = n;
            status.ready_replicas = Some(n);
            status.available_replicas = Some(n);
        }
        _ => {}
    }
}

fn canonical_template(template: &mut PodTemplateSpec) {
    for c in template.spec.iter_mut().flat_map(|p| p.containers.iter_mut()) {
        c.resources = c.resources.take().map(canonical_requirements);
    }
}

fn canonical_claims(claims: &mut Option<Vec<PersistentVolumeClaim>>) {
    for claim in claims.iter_mut().flatten() {
        let requests = claim
            .spec
            .as_mut()
            .and_then(|s| s.resources.as_mut())
            .and_then(|r| r.requests.as_mut());
        for q in requests.into_iter().flat_map(|r| r.values_mut()) {
            *q = canonical(q);
        }
    }
}

/// What the API server does with a write: fold `stringData` into `data`,
/// store quantities in canonical form and drop client-supplied status.
fn as_stored(mut resource: ManagedResource) -> ManagedResource {
    match &mut resource {
        ManagedResource::Secret(s) => {
            if let Some(string_data) = s.string_data.take() {
                let data = s.data.get_or_insert_with(BTreeMap::new);
                for (k, v) in string_data {
                    data.insert(k, ByteString(v.into_bytes()));
                }
            }
        }
        ManagedResource::Deployment(d) => {
            d.status = None;
            if let Some(spec) = d.spec.as_mut() {
                canonical_template(&mut spec.template);
            }
        }
        ManagedResource::StatefulSet(s) => {
            s.status = None;
            if let Some(spec) = s.spec.as_mut() {
                canonical_template(&mut spec.template);
                canonical_claims(&mut spec.volume_claim_templates);
            }
        }
        _ => {}
    }
    resource
}

fn conflict(kind: ResourceKind, name: &str) -> ReconcileError {
    ReconcileError::Conflict {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_search(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Search>, ReconcileError> {
        self.delay().await;
        Ok(self.search(namespace, name))
    }

    async fn list_searches(&self, namespace: &str) -> Result<Vec<Search>, ReconcileError> {
        self.delay().await;
        let st = self.state();
        if let Some(msg) = &st.search_list_failure {
            return Err(ReconcileError::Transient(msg.clone()));
        }
        Ok(st
            .searches
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn update_search_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SearchStatus,
    ) -> Result<(), ReconcileError> {
        self.delay().await;
        let mut st = self.state();
        st.calls.status_writes += 1;
        if let Some(msg) = &st.status_write_failure {
            return Err(ReconcileError::Transient(msg.clone()));
        }
        let version = st.bump();
        let search = st
            .searches
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "Search".into(),
                name: name.to_string(),
            })?;
        search.status = Some(status.clone());
        search.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedResource>, ReconcileError> {
        self.delay().await;
        let mut st = self.state();
        st.calls.gets += 1;
        if let Some(msg) = st.failing_gets.get(&(kind, name.to_string())) {
            return Err(ReconcileError::Transient(msg.clone()));
        }
        Ok(st
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ManagedResource>, ReconcileError> {
        self.delay().await;
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError> {
        self.delay().await;
        let mut st = self.state();
        st.calls.creates += 1;
        let key = key_of(resource);
        if st.pending_conflicts.remove(&(key.0, key.2.clone())) || st.objects.contains_key(&key) {
            return Err(conflict(key.0, &key.2));
        }
        let mut stored = as_stored(resource.clone());
        let version = st.bump();
        let meta = stored.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(format!("uid-{}-{}", key.0, key.2));
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError> {
        self.delay().await;
        let mut st = self.state();
        st.calls.updates += 1;
        let key = key_of(resource);
        if st.pending_conflicts.remove(&(key.0, key.2.clone())) {
            return Err(conflict(key.0, &key.2));
        }
        let Some(current) = st.objects.get(&key) else {
            return Err(ReconcileError::NotFound {
                kind: key.0.to_string(),
                name: key.2,
            });
        };
        if current.resource_version() != resource.resource_version() {
            return Err(conflict(key.0, &key.2));
        }
        let previous = current.clone();
        let mut stored = as_stored(resource.clone());
        match (&mut stored, &previous) {
            (ManagedResource::Deployment(new), ManagedResource::Deployment(old)) => {
                new.status = old.status.clone()
            }
            (ManagedResource::StatefulSet(new), ManagedResource::StatefulSet(old)) => {
                new.status = old.status.clone()
            }
            _ => {}
        }
        stored.meta_mut().resource_version = Some(st.bump());
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        self.delay().await;
        let mut st = self.state();
        st.calls.deletes += 1;
        st.objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn configmap(version: Option<&str>) -> ManagedResource {
        ManagedResource::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                namespace: Some("ns".into()),
                resource_version: version.map(String::from),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = InMemoryCluster::new();
        let created = cluster.create(&configmap(None)).await.unwrap();
        assert!(cluster.create(&configmap(None)).await.is_err());

        let updated = cluster.update(&created).await.unwrap();
        assert_ne!(updated.resource_version(), created.resource_version());
        let err = cluster.update(&created).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict { .. }));
    }

    #[tokio::test]
    async fn secret_string_data_is_folded() {
        let cluster = InMemoryCluster::new();
        let secret = ManagedResource::Secret(Secret {
            metadata: ObjectMeta {
                name: Some("s".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        });
        let ManagedResource::Secret(stored) = cluster.create(&secret).await.unwrap() else {
            panic!("kind changed");
        };
        assert!(stored.string_data.is_none());
        assert_eq!(stored.data.unwrap()["k"], ByteString(b"v".to_vec()));
    }

    #[tokio::test]
    async fn quantities_are_stored_canonically() {
        use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
        use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
        use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

        let cluster = InMemoryCluster::new();
        let deployment = ManagedResource::Deployment(Deployment {
            metadata: ObjectMeta {
                name: Some("d".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "c".into(),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([
                                    ("cpu".to_string(), Quantity("0.5".into())),
                                    ("memory".to_string(), Quantity("0.5Gi".into())),
                                ])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        let ManagedResource::Deployment(stored) = cluster.create(&deployment).await.unwrap() else {
            panic!("kind changed");
        };
        let pod = stored.spec.unwrap().template.spec.unwrap();
        let requests = pod.containers[0].resources.clone().unwrap().requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("500m".into()));
        assert_eq!(requests["memory"], Quantity("512Mi".into()));
    }

    #[tokio::test]
    async fn injected_conflict_fires_once() {
        let cluster = InMemoryCluster::new();
        cluster.inject_conflict(ResourceKind::ConfigMap, "cm");
        assert!(cluster.create(&configmap(None)).await.is_err());
        assert!(cluster.create(&configmap(None)).await.is_ok());
        assert_eq!(cluster.calls().creates, 2);
    }
}
