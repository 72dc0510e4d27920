use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, LocalObjectReference, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, TopologySpreadConstraint, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    Component, DB_SECRET_NAME, LIVENESS_PATH, OwnerIdentity, READINESS_PATH,
    SERVICE_ACCOUNT_NAME, TLS_MOUNT_PATH,
};
use crate::normalize::{ComponentSettings, DatabaseSource, NormalizedSpec};
use crate::resources::{ManagedResource, object_meta, selector_labels, standard_labels};

pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";
const DEFAULT_MODE: i32 = 0o644;
const TLS_VOLUME: &str = "tls-certs";

pub fn literal_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.into(),
                key: key.into(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Connection settings for components that talk to the database.
pub fn database_env(spec: &NormalizedSpec, namespace: &str) -> Vec<EnvVar> {
    let secret = spec.db_secret_name();
    let mut env = vec![
        secret_env("DB_USER", secret, "database-user"),
        secret_env("DB_PASS", secret, "database-password"),
        secret_env("DB_NAME", secret, "database-name"),
    ];
    match spec.db {
        DatabaseSource::BuiltIn { .. } => {
            env.push(literal_env(
                "DB_HOST",
                format!("{}.{}.svc", DB_SECRET_NAME, namespace),
            ));
            env.push(literal_env("DB_PORT", Component::Database.port().to_string()));
        }
        DatabaseSource::External { .. } => {
            env.push(secret_env("DB_HOST", secret, "database-host"));
            env.push(secret_env("DB_PORT", secret, "database-port"));
        }
    }
    env
}

/// Server-side defaults are spelled out so a fetched probe compares equal
/// to a freshly built one.
fn probe(path: &str, port: i32, delay: i32, timeout: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::Int(port),
            scheme: Some("HTTPS".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(delay),
        timeout_seconds: Some(timeout),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

pub fn readiness_probe(component: Component) -> Probe {
    let t = component.probe_timing();
    probe(
        READINESS_PATH,
        component.port(),
        t.readiness_delay,
        t.readiness_timeout,
    )
}

pub fn liveness_probe(component: Component) -> Probe {
    let t = component.probe_timing();
    probe(
        LIVENESS_PATH,
        component.port(),
        t.liveness_delay,
        t.liveness_timeout,
    )
}

pub fn tls_volume(component: Component) -> Volume {
    Volume {
        name: TLS_VOLUME.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(component.tls_secret_name().into()),
            default_mode: Some(DEFAULT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn tls_mount() -> VolumeMount {
    VolumeMount {
        name: TLS_VOLUME.into(),
        mount_path: TLS_MOUNT_PATH.into(),
        read_only: Some(true),
        ..Default::default()
    }
}

pub fn configmap_volume(volume: &str, configmap: &str) -> Volume {
    Volume {
        name: volume.into(),
        config_map: Some(ConfigMapVolumeSource {
            name: configmap.into(),
            default_mode: Some(DEFAULT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The single container of a component with everything but env and extra
/// mounts filled in.
pub fn container(component: Component, settings: &ComponentSettings) -> Container {
    Container {
        name: component.resource_name().into(),
        image: Some(settings.image.clone()),
        image_pull_policy: Some(settings.image_pull_policy.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(port_name(component).into()),
            container_port: component.port(),
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        resources: Some(settings.resources.clone()),
        readiness_probe: Some(readiness_probe(component)),
        liveness_probe: Some(liveness_probe(component)),
        volume_mounts: Some(vec![tls_mount()]),
        ..Default::default()
    }
}

fn port_name(component: Component) -> &'static str {
    if component.is_stateful() {
        "postgres"
    } else {
        "https"
    }
}

fn ha_affinity(component: Component) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(label_selector(component)),
                        topology_key: "kubernetes.io/hostname".into(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn zone_spread(component: Component) -> TopologySpreadConstraint {
    TopologySpreadConstraint {
        max_skew: 1,
        topology_key: "topology.kubernetes.io/zone".into(),
        when_unsatisfiable: "ScheduleAnyway".into(),
        label_selector: Some(label_selector(component)),
        ..Default::default()
    }
}

pub fn label_selector(component: Component) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(component.resource_name())),
        ..Default::default()
    }
}

pub fn pod_template(
    component: Component,
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    container: Container,
    volumes: Vec<Volume>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(standard_labels(component.resource_name())),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            service_account_name: Some(SERVICE_ACCOUNT_NAME.into()),
            node_selector: non_empty(&settings.node_selector),
            image_pull_secrets: settings.image_pull_secret.as_ref().map(|name| {
                vec![LocalObjectReference {
                    name: name.clone(),
                }]
            }),
            affinity: spec.ha.then(|| ha_affinity(component)),
            topology_spread_constraints: spec.ha.then(|| vec![zone_spread(component)]),
            ..Default::default()
        }),
    }
}

pub fn deployment(
    component: Component,
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    owner: &OwnerIdentity,
    container: Container,
    volumes: Vec<Volume>,
) -> ManagedResource {
    let name = component.resource_name();
    ManagedResource::Deployment(Deployment {
        metadata: object_meta(name, &owner.namespace, name),
        spec: Some(DeploymentSpec {
            replicas: Some(settings.replicas),
            selector: label_selector(component),
            template: pod_template(component, spec, settings, container, volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Cluster service in front of a component. The annotation asks the
/// platform's service CA to mint the component's TLS secret.
pub fn service(component: Component, owner: &OwnerIdentity) -> ManagedResource {
    let name = component.resource_name();
    let mut metadata = object_meta(name, &owner.namespace, name);
    metadata.annotations = Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        component.tls_secret_name().to_string(),
    )]));
    ManagedResource::Service(Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(vec![ServicePort {
                name: Some(port_name(component).into()),
                port: component.port(),
                target_port: Some(IntOrString::Int(component.port())),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}
