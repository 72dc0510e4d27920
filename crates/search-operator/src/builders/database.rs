use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    ExecAction, PersistentVolumeClaim, PersistentVolumeClaimSpec, Probe, Secret, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::{Rng, distr::Alphanumeric};

use super::common::{self, literal_env, secret_env};
use super::{Component, DB_SECRET_NAME, OwnerIdentity};
use crate::error::BuildError;
use crate::normalize::{ComponentSettings, DatabaseSource, NormalizedSpec};
use crate::resources::{ManagedResource, object_meta};

pub const DATA_VOLUME: &str = "data";
const DATA_PATH: &str = "/var/lib/pgsql/data";
const CONFIG_VOLUME: &str = "postgresql-cfg";
const CONFIG_PATH: &str = "/opt/app-root/src/postgresql-cfg";
const DB_USER: &str = "searchuser";
const DB_NAME: &str = "search";

const COMPONENT: Component = Component::Database;

pub fn build(
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    owner: &OwnerIdentity,
) -> Result<Vec<ManagedResource>, BuildError> {
    let DatabaseSource::BuiltIn {
        storage_class,
        size,
        db_config,
    } = &spec.db
    else {
        return Ok(Vec::new());
    };

    let mut container = common::container(COMPONENT, settings);
    container.env = Some(vec![
        secret_env("POSTGRESQL_USER", DB_SECRET_NAME, "database-user"),
        secret_env("POSTGRESQL_PASSWORD", DB_SECRET_NAME, "database-password"),
        secret_env("POSTGRESQL_DATABASE", DB_SECRET_NAME, "database-name"),
        literal_env("POSTGRESQL_SHARED_BUFFERS", "64MB"),
    ]);
    // The postgres image serves no HTTP endpoint; its own check script is
    // the health signal.
    let timing = COMPONENT.probe_timing();
    container.readiness_probe = Some(exec_probe(
        &["/usr/libexec/check-container"],
        timing.readiness_delay,
        timing.readiness_timeout,
    ));
    container.liveness_probe = Some(exec_probe(
        &["/usr/libexec/check-container", "--live"],
        timing.liveness_delay,
        timing.liveness_timeout,
    ));

    let mut mounts = vec![
        common::tls_mount(),
        VolumeMount {
            name: DATA_VOLUME.into(),
            mount_path: DATA_PATH.into(),
            ..Default::default()
        },
    ];
    let mut volumes = vec![common::tls_volume(COMPONENT)];
    if let Some(cm) = db_config {
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.into(),
            mount_path: CONFIG_PATH.into(),
            ..Default::default()
        });
        volumes.push(common::configmap_volume(CONFIG_VOLUME, cm));
    }
    container.volume_mounts = Some(mounts);

    let name = COMPONENT.resource_name();
    let statefulset = StatefulSet {
        metadata: object_meta(name, &owner.namespace, name),
        spec: Some(StatefulSetSpec {
            service_name: Some(name.to_string()),
            replicas: Some(settings.replicas),
            selector: common::label_selector(COMPONENT),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Delete".into()),
                    when_scaled: Some("Retain".into()),
                },
            ),
            template: common::pod_template(COMPONENT, spec, settings, container, volumes),
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.into()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".into()]),
                    storage_class_name: storage_class.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([("storage".to_string(), size.clone())])),
                        limits: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(vec![
        credentials_secret(owner),
        common::service(COMPONENT, owner),
        ManagedResource::StatefulSet(statefulset),
    ])
}

fn exec_probe(command: &[&str], delay: i32, timeout: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|s| s.to_string()).collect()),
        }),
        initial_delay_seconds: Some(delay),
        timeout_seconds: Some(timeout),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Credentials for the built-in database. Only ever created, never
/// rewritten, so the random password is generated fresh on each build.
fn credentials_secret(owner: &OwnerIdentity) -> ManagedResource {
    let password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    ManagedResource::Secret(Secret {
        metadata: object_meta(DB_SECRET_NAME, &owner.namespace, COMPONENT.resource_name()),
        type_: Some("Opaque".into()),
        string_data: Some(BTreeMap::from([
            ("database-user".to_string(), DB_USER.to_string()),
            ("database-password".to_string(), password),
            ("database-name".to_string(), DB_NAME.to_string()),
        ])),
        ..Default::default()
    })
}
