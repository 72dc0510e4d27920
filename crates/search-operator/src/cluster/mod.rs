//! Capability interface over the cluster API. The reconciler only ever talks
//! to the cluster through [`ClusterApi`], so tests can swap in
//! [`memory::InMemoryCluster`].

mod kube_client;
pub mod memory;

use async_trait::async_trait;

use crate::crds::search::{Search, SearchStatus};
use crate::error::ReconcileError;
use crate::resources::{ManagedResource, ResourceKind, owner_reference, set_controller_reference};

pub use kube_client::KubeCluster;

pub const FIELD_MANAGER: &str = "search-operator";

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a Search resource; `None` when it does not exist
    async fn get_search(&self, namespace: &str, name: &str)
    -> Result<Option<Search>, ReconcileError>;

    async fn list_searches(&self, namespace: &str) -> Result<Vec<Search>, ReconcileError>;

    /// Overwrite the status subresource
    async fn update_search_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SearchStatus,
    ) -> Result<(), ReconcileError>;

    /// Fetch a child resource; `None` when it does not exist
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedResource>, ReconcileError>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ManagedResource>, ReconcileError>;

    /// Create a child resource. An object that appeared since it was last
    /// fetched is reported as [`ReconcileError::Conflict`].
    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError>;

    /// Replace a child resource. The `resourceVersion` carried by `resource`
    /// must match the stored one, otherwise [`ReconcileError::Conflict`].
    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, ReconcileError>;

    /// Delete a child resource; deleting a missing object succeeds.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ReconcileError>;

    /// Link `child` to `owner` for garbage collection.
    fn set_owner(&self, child: &mut ManagedResource, owner: &Search) -> Result<(), ReconcileError> {
        let owner = owner_reference(owner)?;
        set_controller_reference(child, &owner)
    }
}
