use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{ClusterApi, FIELD_MANAGER};
use crate::crds::search::{Search, SearchStatus};
use crate::error::ReconcileError;
use crate::resources::{ManagedResource, ResourceKind};

/// [`ClusterApi`] backed by a live kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_typed<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ReconcileError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list_typed<K>(&self, namespace: &str) -> Result<Vec<K>, ReconcileError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create_typed<K>(&self, obj: &K) -> Result<K, ReconcileError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        self.api::<K>(&ns)
            .create(&pp, obj)
            .await
            .map_err(|e| write_error::<K>(e, &name))
    }

    async fn replace_typed<K>(&self, obj: &K) -> Result<K, ReconcileError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        self.api::<K>(&ns)
            .replace(&name, &pp, obj)
            .await
            .map_err(|e| write_error::<K>(e, &name))
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 409 on create means someone else created it, on replace that our
/// resourceVersion is stale. Either way the next pass starts over.
fn write_error<K: Resource<DynamicType = ()>>(err: kube::Error, name: &str) -> ReconcileError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => ReconcileError::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        other => other.into(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_search(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Search>, ReconcileError> {
        self.get_typed::<Search>(namespace, name).await
    }

    async fn list_searches(&self, namespace: &str) -> Result<Vec<Search>, ReconcileError> {
        self.list_typed::<Search>(namespace).await
    }

    async fn update_search_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SearchStatus,
    ) -> Result<(), ReconcileError> {
        let api: Api<Search> = self.api(namespace);
        let pp = PatchParams::apply(FIELD_MANAGER);
        let _ = api
            .patch_status(
                name,
                &pp,
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        debug!(namespace, name, "status written");
        Ok(())
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedResource>, ReconcileError> {
        Ok(match kind {
            ResourceKind::Deployment => self
                .get_typed::<Deployment>(namespace, name)
                .await?
                .map(ManagedResource::Deployment),
            ResourceKind::StatefulSet => self
                .get_typed::<StatefulSet>(namespace, name)
                .await?
                .map(ManagedResource::StatefulSet),
            ResourceKind::Service => self
                .get_typed::<Service>(namespace, name)
                .await?
                .map(ManagedResource::Service),
            ResourceKind::Secret => self
                .get_typed::<Secret>(namespace, name)
                .await?
                .map(ManagedResource::Secret),
            ResourceKind::ConfigMap => self
                .get_typed::<ConfigMap>(namespace, name)
                .await?
                .map(ManagedResource::ConfigMap),
            ResourceKind::ServiceAccount => self
                .get_typed::<ServiceAccount>(namespace, name)
                .await?
                .map(ManagedResource::ServiceAccount),
        })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ManagedResource>, ReconcileError> {
        fn wrap<K>(items: Vec<K>, f: fn(K) -> ManagedResource) -> Vec<ManagedResource> {
            items.into_iter().map(f).collect()
        }
        Ok(match kind {
            ResourceKind::Deployment => wrap(
                self.list_typed::<Deployment>(namespace).await?,
                ManagedResource::Deployment,
            ),
            ResourceKind::StatefulSet => wrap(
                self.list_typed::<StatefulSet>(namespace).await?,
                ManagedResource::StatefulSet,
            ),
            ResourceKind::Service => wrap(
                self.list_typed::<Service>(namespace).await?,
                ManagedResource::Service,
            ),
            ResourceKind::Secret => wrap(
                self.list_typed::<Secret>(namespace).await?,
                ManagedResource::Secret,
            ),
            ResourceKind::ConfigMap => wrap(
                self.list_typed::<ConfigMap>(namespace).await?,
                ManagedResource::ConfigMap,
            ),
            ResourceKind::ServiceAccount => wrap(
                self.list_typed::<ServiceAccount>(namespace).await?,
                ManagedResource::ServiceAccount,
            ),
        })
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError> {
        Ok(match resource {
            ManagedResource::Deployment(o) => {
                ManagedResource::Deployment(self.create_typed(o).await?)
            }
            ManagedResource::StatefulSet(o) => {
                ManagedResource::StatefulSet(self.create_typed(o).await?)
            }
            ManagedResource::Service(o) => ManagedResource::Service(self.create_typed(o).await?),
            ManagedResource::Secret(o) => ManagedResource::Secret(self.create_typed(o).await?),
            ManagedResource::ConfigMap(o) => {
                ManagedResource::ConfigMap(self.create_typed(o).await?)
            }
            ManagedResource::ServiceAccount(o) => {
                ManagedResource::ServiceAccount(self.create_typed(o).await?)
            }
        })
    }

    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError> {
        Ok(match resource {
            ManagedResource::Deployment(o) => {
                ManagedResource::Deployment(self.replace_typed(o).await?)
            }
            ManagedResource::StatefulSet(o) => {
                ManagedResource::StatefulSet(self.replace_typed(o).await?)
            }
            ManagedResource::Service(o) => ManagedResource::Service(self.replace_typed(o).await?),
            ManagedResource::Secret(o) => ManagedResource::Secret(self.replace_typed(o).await?),
            ManagedResource::ConfigMap(o) => {
                ManagedResource::ConfigMap(self.replace_typed(o).await?)
            }
            ManagedResource::ServiceAccount(o) => {
                ManagedResource::ServiceAccount(self.replace_typed(o).await?)
            }
        })
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        match kind {
            ResourceKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            ResourceKind::StatefulSet => self.delete_typed::<StatefulSet>(namespace, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(namespace, name).await,
            ResourceKind::Secret => self.delete_typed::<Secret>(namespace, name).await,
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(namespace, name).await,
            ResourceKind::ServiceAccount => {
                self.delete_typed::<ServiceAccount>(namespace, name).await
            }
        }
    }
}
