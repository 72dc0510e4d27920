use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyOutcome, DiffApplyEngine, with_deadline};
use crate::builders::{
    COLLECTOR_CONFIG_NAME, Component, OwnerIdentity, SERVICE_ACCOUNT_NAME, build, build_shared,
    validate_filters,
};
use crate::cluster::ClusterApi;
use crate::config::OperatorConfig;
use crate::crds::search::{Search, SearchStatus};
use crate::error::ReconcileError;
use crate::normalize::normalize;
use crate::resources::ResourceKind;
use crate::status;

/// When the controller should look at a Search again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing to do until the object changes
    AwaitChange,
    Periodic,
    Backoff,
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub outcomes: Vec<ApplyOutcome>,
    /// Status written at the end of the pass, if any
    pub status: Option<SearchStatus>,
    pub requeue: Requeue,
}

impl ReconcileReport {
    fn skipped() -> Self {
        Self {
            outcomes: Vec::new(),
            status: None,
            requeue: Requeue::AwaitChange,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ReconcileError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    pub fn action(&self, config: &OperatorConfig) -> Action {
        match self.requeue {
            Requeue::AwaitChange => Action::await_change(),
            Requeue::Periodic => Action::requeue(config.resync_interval),
            Requeue::Backoff => Action::requeue(config.retry_backoff),
        }
    }
}

/// Drives one Search towards its desired state through a [`ClusterApi`].
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    config: OperatorConfig,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: OperatorConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// One full pass. Only failing to load the Search or to write its status
    /// is returned as an error; everything else is reported per resource.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileReport, ReconcileError> {
        let deadline = self.config.api_timeout;
        let Some(search) =
            with_deadline(deadline, self.cluster.get_search(namespace, name)).await?
        else {
            debug!(namespace, name, "search no longer exists");
            return Ok(ReconcileReport::skipped());
        };
        if search.metadata.deletion_timestamp.is_some() {
            debug!(namespace, name, "search is being deleted");
            return Ok(ReconcileReport::skipped());
        }

        let generation = search.metadata.generation;
        let previous = search.status.as_ref();

        match self.namespace_owner(namespace).await {
            Ok(Some(winner)) if winner != name => {
                warn!(namespace, name, owner = %winner, "duplicate Search, not applying");
                let status = status::duplicate(previous, &winner, generation, OffsetDateTime::now_utc());
                self.write_status(namespace, name, &status).await?;
                return Ok(ReconcileReport {
                    outcomes: Vec::new(),
                    status: Some(status),
                    requeue: Requeue::Periodic,
                });
            }
            Ok(_) => {}
            Err(e) => {
                // ownership unknown, so nothing is applied this pass
                warn!(namespace, name, error = %e, "listing Searches failed");
                let status = status::blocked(
                    previous,
                    &e.kind().to_string(),
                    format!("listing Searches in {namespace}: {e}"),
                    generation,
                    OffsetDateTime::now_utc(),
                );
                self.write_status(namespace, name, &status).await?;
                return Ok(ReconcileReport {
                    outcomes: Vec::new(),
                    status: Some(status),
                    requeue: if e.is_retryable() {
                        Requeue::Backoff
                    } else {
                        Requeue::Periodic
                    },
                });
            }
        }

        info!(namespace, name, "reconciling");
        let spec = normalize(&search.spec, &self.config);
        let owner = OwnerIdentity::new(namespace, name);
        let engine = DiffApplyEngine::new(self.cluster.as_ref(), deadline);

        let mut outcomes = Vec::new();
        let mut keep = BTreeSet::new();
        let mut prune_safe = true;

        match build_shared(&owner) {
            Ok(shared) => {
                for desired in shared {
                    keep.insert((desired.kind(), desired.name().to_string()));
                    outcomes.push(engine.apply(None, desired, &search).await);
                }
            }
            Err(e) => {
                prune_safe = false;
                outcomes.push(ApplyOutcome::failed(
                    None,
                    ResourceKind::ServiceAccount,
                    SERVICE_ACCOUNT_NAME,
                    e.into(),
                ));
            }
        }

        for component in spec.enabled_components() {
            let desired = match build(component, &spec, &owner) {
                Ok(desired) => desired,
                Err(e) => {
                    prune_safe = false;
                    outcomes.push(ApplyOutcome::failed(
                        Some(component),
                        workload_kind(component),
                        component.resource_name(),
                        e.into(),
                    ));
                    continue;
                }
            };
            keep.extend(desired.iter().map(|r| (r.kind(), r.name().to_string())));

            if component == Component::Collector {
                if let Err(e) = validate_filters(&spec.filters) {
                    warn!(namespace, name, error = %e, "rejecting collector filters");
                    outcomes.push(ApplyOutcome::failed(
                        Some(component),
                        ResourceKind::ConfigMap,
                        COLLECTOR_CONFIG_NAME,
                        e,
                    ));
                    continue;
                }
            }

            for resource in desired {
                outcomes.push(engine.apply(Some(component), resource, &search).await);
            }
        }

        if prune_safe {
            outcomes.extend(engine.prune(&search, &keep).await);
        }

        let status = status::aggregate(
            previous,
            &outcomes,
            &spec,
            generation,
            OffsetDateTime::now_utc(),
        );
        self.write_status(namespace, name, &status).await?;

        let requeue = if outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err())
            .any(ReconcileError::is_retryable)
        {
            Requeue::Backoff
        } else {
            Requeue::Periodic
        };
        info!(
            namespace,
            name,
            health = status.search_health.as_deref().unwrap_or_default(),
            writes = outcomes.iter().filter(|o| o.is_write()).count(),
            ?requeue,
            "reconciled"
        );

        Ok(ReconcileReport {
            outcomes,
            status: Some(status),
            requeue,
        })
    }

    /// Name of the Search that owns this namespace's children: the
    /// lexicographically smallest one not being deleted.
    async fn namespace_owner(&self, namespace: &str) -> Result<Option<String>, ReconcileError> {
        let searches =
            with_deadline(self.config.api_timeout, self.cluster.list_searches(namespace)).await?;
        Ok(searches
            .iter()
            .filter(|s| s.metadata.deletion_timestamp.is_none())
            .map(|s| s.name_any())
            .min())
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SearchStatus,
    ) -> Result<(), ReconcileError> {
        with_deadline(
            self.config.api_timeout,
            self.cluster.update_search_status(namespace, name, status),
        )
        .await
    }
}

fn workload_kind(component: Component) -> ResourceKind {
    if component.is_stateful() {
        ResourceKind::StatefulSet
    } else {
        ResourceKind::Deployment
    }
}

#[derive(Clone)]
pub struct Ctx {
    pub reconciler: Reconciler,
}

pub fn controller(client: Client) -> Controller<Search> {
    let api: Api<Search> = Api::all(client.clone());
    Controller::new(api, watcher::Config::default())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ConfigMap>::all(client), watcher::Config::default())
        .shutdown_on_signal()
}

pub async fn reconcile(search: Arc<Search>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let ns = search
        .namespace()
        .ok_or_else(|| ReconcileError::FatalConfig("Search must be namespaced".into()))?;
    let name = search.name_any();
    let report = ctx.reconciler.reconcile(&ns, &name).await?;
    Ok(report.action(ctx.reconciler.config()))
}

pub fn error_policy(search: Arc<Search>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    error!(name = %search.name_any(), kind = %err.kind(), error = ?err, "reconcile failed");
    Action::requeue(ctx.reconciler.config().retry_backoff)
}
