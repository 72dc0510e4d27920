use k8s_openapi::api::core::v1::EnvVar;

use super::collector::aggregator_url;
use super::common::{self, literal_env};
use super::{Component, OwnerIdentity};
use crate::error::BuildError;
use crate::normalize::{ComponentSettings, NormalizedSpec};
use crate::resources::ManagedResource;

const COMPONENT: Component = Component::RemoteCollector;

pub fn build(
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    owner: &OwnerIdentity,
) -> Result<Vec<ManagedResource>, BuildError> {
    let mut container = common::container(COMPONENT, settings);
    let mut env = vec![
        literal_env("AGGREGATOR_URL", aggregator_url(&owner.namespace)),
        literal_env("DEPLOYED_IN_HUB", "false"),
    ];
    env.extend(proxy_env(settings));
    container.env = Some(env);

    Ok(vec![
        common::service(COMPONENT, owner),
        common::deployment(
            COMPONENT,
            spec,
            settings,
            owner,
            container,
            vec![common::tls_volume(COMPONENT)],
        ),
    ])
}

/// `proxyConfig` entries as conventional proxy environment variables.
fn proxy_env(settings: &ComponentSettings) -> Vec<EnvVar> {
    settings
        .proxy_config
        .iter()
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(key, value)| {
            let name = match key.as_str() {
                "httpProxy" => "HTTP_PROXY".to_string(),
                "httpsProxy" => "HTTPS_PROXY".to_string(),
                "noProxy" => "NO_PROXY".to_string(),
                other => other.trim().to_ascii_uppercase().replace('-', "_"),
            };
            literal_env(&name, value.clone())
        })
        .collect()
}
