use super::common::{self, literal_env};
use super::{Component, OwnerIdentity};
use crate::error::BuildError;
use crate::normalize::{ComponentSettings, NormalizedSpec};
use crate::resources::ManagedResource;

const COMPONENT: Component = Component::Api;

pub fn build(
    spec: &NormalizedSpec,
    settings: &ComponentSettings,
    owner: &OwnerIdentity,
) -> Result<Vec<ManagedResource>, BuildError> {
    let mut container = common::container(COMPONENT, settings);
    let mut env = common::database_env(spec, &owner.namespace);
    env.push(literal_env("API_SERVER_PORT", COMPONENT.port().to_string()));
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
