use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use search_operator::apply::ApplyAction;
use search_operator::cluster::memory::InMemoryCluster;
use search_operator::config::OperatorConfig;
use search_operator::crds::search::{
    ConditionStatus, ConditionType, DeploymentConfig, Search, SearchSpec, StorageSpec,
};
use search_operator::error::{ErrorKind, ReconcileError};
use search_operator::resources::{ManagedResource, ResourceKind};
use search_operator::search_controller::{Reconciler, Requeue};

const NS: &str = "open-cluster-management";
const NAME: &str = "search-v2-operator";

fn search(name: &str, spec: SearchSpec) -> Search {
    let mut s = Search::new(name, spec);
    s.metadata.namespace = Some(NS.into());
    s.metadata.generation = Some(1);
    s
}

fn setup(spec: SearchSpec) -> (Arc<InMemoryCluster>, Reconciler) {
    setup_with(spec, OperatorConfig::default())
}

fn setup_with(spec: SearchSpec, config: OperatorConfig) -> (Arc<InMemoryCluster>, Reconciler) {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.insert_search(search(NAME, spec));
    let reconciler = Reconciler::new(cluster.clone(), config);
    (cluster, reconciler)
}

fn update_spec(cluster: &InMemoryCluster, edit: impl FnOnce(&mut SearchSpec)) {
    let mut current = cluster.search(NS, NAME).expect("search exists");
    edit(&mut current.spec);
    current.metadata.generation = current.metadata.generation.map(|g| g + 1);
    cluster.insert_search(current);
}

fn deployment(cluster: &InMemoryCluster, name: &str) -> Option<Deployment> {
    match cluster.object(ResourceKind::Deployment, NS, name) {
        Some(ManagedResource::Deployment(d)) => Some(d),
        _ => None,
    }
}

fn statefulset(cluster: &InMemoryCluster, name: &str) -> Option<StatefulSet> {
    match cluster.object(ResourceKind::StatefulSet, NS, name) {
        Some(ManagedResource::StatefulSet(s)) => Some(s),
        _ => None,
    }
}

fn replicas(d: &Deployment) -> Option<i32> {
    d.spec.as_ref().and_then(|s| s.replicas)
}

fn env(d: &Deployment) -> Vec<EnvVar> {
    d.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers[0].env.clone())
        .unwrap_or_default()
}

fn condition(cluster: &InMemoryCluster, type_: ConditionType) -> (ConditionStatus, String) {
    let status = cluster.search(NS, NAME).unwrap().status.expect("status written");
    let c = status.condition(type_).expect("condition present");
    (c.status, c.reason.clone())
}

#[tokio::test]
async fn first_pass_creates_every_child_with_owner() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    let report = reconciler.reconcile(NS, NAME).await.unwrap();

    assert_eq!(report.errors().count(), 0);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Ok(ApplyAction::Created)))
    );

    let expected = [
        (ResourceKind::ServiceAccount, "search-serviceaccount"),
        (ResourceKind::Secret, "search-postgres"),
        (ResourceKind::Service, "search-postgres"),
        (ResourceKind::StatefulSet, "search-postgres"),
        (ResourceKind::Service, "search-indexer"),
        (ResourceKind::Deployment, "search-indexer"),
        (ResourceKind::ConfigMap, "search-collector-config"),
        (ResourceKind::Service, "search-collector"),
        (ResourceKind::Deployment, "search-collector"),
        (ResourceKind::Service, "search-api"),
        (ResourceKind::Deployment, "search-api"),
    ];
    for (kind, name) in expected {
        let obj = cluster
            .object(kind, NS, name)
            .unwrap_or_else(|| panic!("{kind} {name} missing"));
        let owners = obj.meta().owner_references.clone().unwrap_or_default();
        assert_eq!(owners.len(), 1, "{kind} {name}");
        assert_eq!(owners[0].kind, "Search");
        assert_eq!(owners[0].name, NAME);
        assert_eq!(owners[0].controller, Some(true));
    }
    assert_eq!(cluster.objects().len(), expected.len());
    assert!(deployment(&cluster, "search-remote-collector").is_none());

    // nothing is rolled out yet
    assert_eq!(report.requeue, Requeue::Periodic);
    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.search_health.as_deref(), Some("degraded"));
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(
        condition(&cluster, ConditionType::Progressing),
        (ConditionStatus::True, "ResourcesUpdated".to_string())
    );
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    cluster.mark_all_available();
    cluster.reset_calls();

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(cluster.calls().writes(), 0);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Ok(ApplyAction::Unchanged)))
    );
    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.search_health.as_deref(), Some("healthy"));
    assert_eq!(status.db_in_use.as_deref(), Some("search-postgres"));
    assert_eq!(status.storage_in_use.as_deref(), Some("default:10Gi"));
    assert_eq!(
        condition(&cluster, ConditionType::Available),
        (ConditionStatus::True, "AllComponentsReady".to_string())
    );
}

#[tokio::test]
async fn respelled_quantities_settle_after_one_pass() {
    let mut spec = SearchSpec {
        db_storage: StorageSpec {
            storage_class_name: None,
            size: Some(Quantity("0.5Gi".into())),
        },
        ..Default::default()
    };
    spec.deployments.api = DeploymentConfig {
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("0.5".into())),
                ("memory".to_string(), Quantity("1Gi".into())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };
    let (cluster, reconciler) = setup(spec);
    reconciler.reconcile(NS, NAME).await.unwrap();
    cluster.mark_all_available();
    cluster.reset_calls();

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.errors().count(), 0);
    assert_eq!(cluster.calls().writes(), 0);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Ok(ApplyAction::Unchanged)))
    );

    let db = statefulset(&cluster, "search-postgres").unwrap();
    let claim = db.spec.unwrap().volume_claim_templates.unwrap().remove(0);
    let requests = claim.spec.unwrap().resources.unwrap().requests.unwrap();
    assert_eq!(requests["storage"], Quantity("512Mi".into()));
    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.storage_in_use.as_deref(), Some("default:512Mi"));
}

#[tokio::test]
async fn conditions_are_stable_across_passes() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    cluster.mark_all_available();
    reconciler.reconcile(NS, NAME).await.unwrap();
    let before = cluster.search(NS, NAME).unwrap().status.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    reconciler.reconcile(NS, NAME).await.unwrap();
    let after = cluster.search(NS, NAME).unwrap().status.unwrap();

    assert_eq!(before.conditions, after.conditions);
    for type_ in [
        ConditionType::Available,
        ConditionType::Progressing,
        ConditionType::Degraded,
    ] {
        assert_eq!(
            after.conditions.iter().filter(|c| c.type_ == type_).count(),
            1
        );
    }
}

#[tokio::test]
async fn deleted_child_is_recreated() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    cluster.remove(ResourceKind::Deployment, NS, "search-api");
    cluster.reset_calls();

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    let recreated = report
        .outcomes
        .iter()
        .find(|o| o.kind == ResourceKind::Deployment && o.name == "search-api")
        .unwrap();
    assert!(matches!(recreated.result, Ok(ApplyAction::Created)));
    assert_eq!(cluster.calls().creates, 1);
    assert_eq!(cluster.calls().updates, 0);
    assert!(deployment(&cluster, "search-api").is_some());
}

#[tokio::test]
async fn drift_is_corrected_but_foreign_metadata_survives() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();

    let mut drifted = deployment(&cluster, "search-indexer").unwrap();
    drifted.spec.as_mut().unwrap().replicas = Some(5);
    drifted
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert("deployment.kubernetes.io/revision".into(), "4".into());
    drifted
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert("team".into(), "observability".into());
    cluster.put(ManagedResource::Deployment(drifted));
    cluster.reset_calls();

    reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(cluster.calls().updates, 1);
    let fixed = deployment(&cluster, "search-indexer").unwrap();
    assert_eq!(replicas(&fixed), Some(1));
    assert_eq!(
        fixed.metadata.annotations.as_ref().unwrap()["deployment.kubernetes.io/revision"],
        "4"
    );
    assert_eq!(fixed.metadata.labels.as_ref().unwrap()["team"], "observability");

    // foreign metadata alone is not drift
    cluster.reset_calls();
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(cluster.calls().writes(), 0);
}

#[tokio::test]
async fn ha_toggle_scales_stateless_components_only() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(replicas(&deployment(&cluster, "search-indexer").unwrap()), Some(1));

    update_spec(&cluster, |spec| spec.enable_ha = true);
    reconciler.reconcile(NS, NAME).await.unwrap();

    for name in ["search-indexer", "search-collector", "search-api"] {
        let d = deployment(&cluster, name).unwrap();
        assert_eq!(replicas(&d), Some(2), "{name}");
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert!(pod.affinity.is_some(), "{name}");
        assert!(pod.topology_spread_constraints.is_some(), "{name}");
    }
    let db = statefulset(&cluster, "search-postgres").unwrap();
    assert_eq!(db.spec.unwrap().replicas, Some(1));

    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.observed_generation, Some(2));
}

#[tokio::test]
async fn explicit_replica_count_wins_over_ha() {
    let mut spec = SearchSpec {
        enable_ha: true,
        ..Default::default()
    };
    spec.deployments.api.replica_count = Some(4);
    let (cluster, reconciler) = setup(spec);
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(replicas(&deployment(&cluster, "search-api").unwrap()), Some(4));
    assert_eq!(replicas(&deployment(&cluster, "search-indexer").unwrap()), Some(2));
}

#[tokio::test]
async fn conflict_fails_one_resource_and_is_retried() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    cluster.inject_conflict(ResourceKind::Deployment, "search-indexer");

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.requeue, Requeue::Backoff);
    let failed: Vec<_> = report.outcomes.iter().filter(|o| o.result.is_err()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "search-indexer");
    assert_eq!(failed[0].error_kind(), Some(ErrorKind::Conflict));
    assert!(deployment(&cluster, "search-indexer").is_none());
    assert!(deployment(&cluster, "search-api").is_some());
    assert_eq!(
        condition(&cluster, ConditionType::Degraded),
        (ConditionStatus::True, "Conflict".to_string())
    );

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.errors().count(), 0);
    assert!(deployment(&cluster, "search-indexer").is_some());
    assert_eq!(condition(&cluster, ConditionType::Degraded).0, ConditionStatus::False);
}

#[tokio::test]
async fn stale_update_is_reported_as_conflict() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    update_spec(&cluster, |spec| spec.deployments.api.replica_count = Some(3));
    cluster.inject_conflict(ResourceKind::Deployment, "search-api");

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.requeue, Requeue::Backoff);
    assert_eq!(replicas(&deployment(&cluster, "search-api").unwrap()), Some(1));

    reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(replicas(&deployment(&cluster, "search-api").unwrap()), Some(3));
}

#[tokio::test]
async fn missing_search_is_a_no_op() {
    let cluster = Arc::new(InMemoryCluster::new());
    let reconciler = Reconciler::new(cluster.clone(), OperatorConfig::default());
    let report = reconciler.reconcile(NS, "gone").await.unwrap();
    assert_eq!(report.requeue, Requeue::AwaitChange);
    assert!(report.status.is_none());
    assert_eq!(cluster.calls().writes(), 0);
    assert_eq!(cluster.calls().status_writes, 0);
}

#[tokio::test]
async fn status_is_written_when_a_component_fails() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    cluster.fail_gets(ResourceKind::Deployment, "search-api", "etcd unavailable");

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.requeue, Requeue::Backoff);
    assert_eq!(cluster.calls().status_writes, 1);
    assert!(deployment(&cluster, "search-indexer").is_some());
    assert!(deployment(&cluster, "search-collector").is_some());

    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.search_health.as_deref(), Some("degraded"));
    let degraded = status.condition(ConditionType::Degraded).unwrap();
    assert_eq!(degraded.reason, "TransientAPIError");
    assert!(degraded.message.contains("api: "));
}

#[tokio::test]
async fn failed_status_write_aborts_the_pass() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    cluster.fail_status_writes("status subresource unavailable");
    let err = reconciler.reconcile(NS, NAME).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    // children were still applied
    assert!(deployment(&cluster, "search-api").is_some());
}

#[tokio::test]
async fn slow_cluster_hits_the_call_deadline() {
    let config = OperatorConfig {
        api_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let (cluster, reconciler) = setup_with(SearchSpec::default(), config);
    cluster.set_latency(Some(Duration::from_millis(200)));

    let err = reconciler.reconcile(NS, NAME).await.unwrap_err();
    assert!(matches!(err, ReconcileError::DeadlineExceeded(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn only_one_search_per_namespace_applies() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    cluster.insert_search(search("another-search", SearchSpec::default()));

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert!(cluster.objects().is_empty());
    assert_eq!(
        condition(&cluster, ConditionType::Degraded),
        (ConditionStatus::True, "DuplicateSearch".to_string())
    );

    reconciler.reconcile(NS, "another-search").await.unwrap();
    assert!(deployment(&cluster, "search-api").is_some());
}

#[tokio::test]
async fn failed_search_listing_is_reported_in_status() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    cluster.fail_search_lists("etcd unavailable");

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert!(cluster.objects().is_empty());
    assert_eq!(report.requeue, Requeue::Backoff);
    assert_eq!(cluster.calls().status_writes, 1);
    let (status, reason) = condition(&cluster, ConditionType::Degraded);
    assert_eq!(status, ConditionStatus::True);
    assert_eq!(reason, "TransientAPIError");

    cluster.clear_failures();
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(deployment(&cluster, "search-api").is_some());
}

#[tokio::test]
async fn custom_database_disables_builtin_one() {
    let spec = SearchSpec {
        custom_db_config: Some("my-db".into()),
        ..Default::default()
    };
    let (cluster, reconciler) = setup(spec);
    reconciler.reconcile(NS, NAME).await.unwrap();

    assert!(statefulset(&cluster, "search-postgres").is_none());
    assert!(cluster.object(ResourceKind::Secret, NS, "search-postgres").is_none());
    let indexer = deployment(&cluster, "search-indexer").unwrap();
    let host = env(&indexer).into_iter().find(|e| e.name == "DB_HOST").unwrap();
    let from = host.value_from.unwrap().secret_key_ref.unwrap();
    assert_eq!(from.name, "my-db");

    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.db_in_use.as_deref(), Some("my-db"));
    assert_eq!(status.storage_in_use.as_deref(), Some("none"));
}

#[tokio::test]
async fn switching_to_custom_database_prunes_builtin_workload() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(statefulset(&cluster, "search-postgres").is_some());

    update_spec(&cluster, |spec| spec.custom_db_config = Some("my-db".into()));
    let report = reconciler.reconcile(NS, NAME).await.unwrap();

    let deleted: Vec<_> = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.result, Ok(ApplyAction::Deleted)))
        .map(|o| (o.kind, o.name.as_str()))
        .collect();
    assert_eq!(
        deleted,
        vec![
            (ResourceKind::StatefulSet, "search-postgres"),
            (ResourceKind::Service, "search-postgres"),
        ]
    );
    assert!(statefulset(&cluster, "search-postgres").is_none());
    // credentials are kept
    assert!(cluster.object(ResourceKind::Secret, NS, "search-postgres").is_some());
}

#[tokio::test]
async fn remote_collector_follows_the_spec() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    update_spec(&cluster, |spec| {
        spec.deployments.remote_collector = Some(DeploymentConfig {
            proxy_config: BTreeMap::from([("httpsProxy".into(), "http://proxy:3128".into())]),
            ..Default::default()
        })
    });
    reconciler.reconcile(NS, NAME).await.unwrap();
    let remote = deployment(&cluster, "search-remote-collector").unwrap();
    assert!(
        env(&remote)
            .iter()
            .any(|e| e.name == "HTTPS_PROXY" && e.value.as_deref() == Some("http://proxy:3128"))
    );

    update_spec(&cluster, |spec| spec.deployments.remote_collector = None);
    reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(deployment(&cluster, "search-remote-collector").is_none());
    assert!(deployment(&cluster, "search-collector").is_some());
}

#[tokio::test]
async fn unowned_objects_are_never_pruned() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    let mut stray = Deployment::default();
    stray.metadata.name = Some("search-remote-collector".into());
    stray.metadata.namespace = Some(NS.into());
    cluster.put(ManagedResource::Deployment(stray));

    reconciler.reconcile(NS, NAME).await.unwrap();
    assert!(deployment(&cluster, "search-remote-collector").is_some());
}

#[tokio::test]
async fn invalid_filters_degrade_only_the_collector() {
    let mut spec = SearchSpec::default();
    spec.allow_deny_resources
        .allowed_resources
        .insert("Pod".into(), vec!["".into()]);
    let (cluster, reconciler) = setup(spec);

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    assert_eq!(report.requeue, Requeue::Periodic);
    assert!(
        cluster
            .object(ResourceKind::ConfigMap, NS, "search-collector-config")
            .is_none()
    );
    assert!(deployment(&cluster, "search-collector").is_none());
    assert!(deployment(&cluster, "search-api").is_some());
    assert_eq!(
        condition(&cluster, ConditionType::Degraded),
        (ConditionStatus::True, "ValidationError".to_string())
    );
}

#[tokio::test]
async fn storage_resize_is_reported_not_applied() {
    let (cluster, reconciler) = setup(SearchSpec::default());
    reconciler.reconcile(NS, NAME).await.unwrap();
    update_spec(&cluster, |spec| spec.db_storage.size = Some(Quantity("50Gi".into())));
    cluster.reset_calls();

    let report = reconciler.reconcile(NS, NAME).await.unwrap();
    let db = report
        .outcomes
        .iter()
        .find(|o| o.kind == ResourceKind::StatefulSet)
        .unwrap();
    assert!(matches!(
        db.result,
        Err(ReconcileError::ImmutableField {
            field: "spec.volumeClaimTemplates",
            ..
        })
    ));
    assert_eq!(cluster.calls().updates, 0);
    assert_eq!(report.requeue, Requeue::Periodic);
    let status = cluster.search(NS, NAME).unwrap().status.unwrap();
    // the stored claim template still asks for the old size
    assert_eq!(status.storage_in_use.as_deref(), Some("default:10Gi"));
    assert_eq!(
        condition(&cluster, ConditionType::Degraded),
        (ConditionStatus::True, "ValidationError".to_string())
    );
}
