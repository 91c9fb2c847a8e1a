//! Helpers for the `envFrom` list of a Deployment's pod template.
//!
//! Only the first container is considered. Deployments with more than one
//! container keep their other containers untouched.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMapEnvSource, Container, EnvFromSource};

fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment.spec.as_ref()?.template.spec.as_ref()?.containers.first()
}

fn first_container_mut(deployment: &mut Deployment) -> Option<&mut Container> {
    deployment
        .spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .first_mut()
}

fn is_ref_to(source: &EnvFromSource, config_map: &str) -> bool {
    source
        .config_map_ref
        .as_ref()
        .is_some_and(|r| r.name == config_map)
}

/// Number of `envFrom` entries in the first container that reference `config_map`.
pub fn count_config_refs(deployment: &Deployment, config_map: &str) -> usize {
    first_container(deployment)
        .and_then(|c| c.env_from.as_ref())
        .map(|sources| sources.iter().filter(|s| is_ref_to(s, config_map)).count())
        .unwrap_or(0)
}

/// Whether the first container references `config_map` at all.
pub fn has_config_ref(deployment: &Deployment, config_map: &str) -> bool {
    count_config_refs(deployment, config_map) > 0
}

/// Appends a reference to `config_map` unless one is already present.
///
/// Returns whether the Deployment changed. A Deployment without containers is
/// left alone.
pub fn add_config_ref(deployment: &mut Deployment, config_map: &str) -> bool {
    if has_config_ref(deployment, config_map) {
        return false;
    }
    let Some(container) = first_container_mut(deployment) else {
        return false;
    };
    container
        .env_from
        .get_or_insert_with(Vec::new)
        .push(EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: config_map.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    true
}

/// Removes every reference to `config_map`, not just the first.
///
/// Returns whether the Deployment changed. An emptied list is dropped entirely.
pub fn remove_config_ref(deployment: &mut Deployment, config_map: &str) -> bool {
    let Some(sources) = first_container_mut(deployment).and_then(|c| c.env_from.as_mut()) else {
        return false;
    };
    let before = sources.len();
    sources.retain(|s| !is_ref_to(s, config_map));
    let changed = sources.len() != before;
    if sources.is_empty() {
        if let Some(container) = first_container_mut(deployment) {
            container.env_from = None;
        }
    }
    changed
}

/// Distinct ConfigMaps the first container references, in first-seen order.
pub fn referenced_config_maps(deployment: &Deployment) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let sources = first_container(deployment).and_then(|c| c.env_from.as_ref());
    for source in sources.into_iter().flatten() {
        if let Some(r) = source.config_map_ref.as_ref() {
            if !names.contains(&r.name) {
                names.push(r.name.clone());
            }
        }
    }
    names
}

/// Names of containers after the first; they are never touched.
pub fn untouched_containers(deployment: &Deployment) -> Vec<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| pod.containers.iter().skip(1).map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_referenced_config_maps_dedups_and_keeps_order() {
        let d = create_test_deployment("ns1", "svc-a", &["db-config", "app-config", "db-config"]);
        assert_eq!(referenced_config_maps(&d), vec!["db-config", "app-config"]);

        let sidecar = create_test_deployment_with_sidecar("ns1", "svc-b", "proxy");
        assert!(referenced_config_maps(&sidecar).is_empty());
    }

    #[test]
    fn test_add_to_empty_list() {
        let mut d = create_test_deployment("ns1", "svc-a", &[]);
        assert!(add_config_ref(&mut d, "app-config"));
        assert_eq!(count_config_refs(&d, "app-config"), 1);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut d = create_test_deployment("ns1", "svc-a", &["app-config"]);
        assert!(!add_config_ref(&mut d, "app-config"));
        assert_eq!(count_config_refs(&d, "app-config"), 1);
    }

    #[test]
    fn test_add_preserves_other_refs_and_order() {
        let mut d = create_test_deployment("ns1", "svc-a", &["other"]);
        assert!(add_config_ref(&mut d, "app-config"));
        assert_eq!(env_from_names(&d), vec!["other", "app-config"]);
    }

    #[test]
    fn test_remove_deletes_all_duplicates() {
        let mut d = create_test_deployment("ns1", "svc-a", &["app-config", "other", "app-config"]);
        assert!(remove_config_ref(&mut d, "app-config"));
        assert_eq!(count_config_refs(&d, "app-config"), 0);
        assert_eq!(env_from_names(&d), vec!["other"]);
    }

    #[test]
    fn test_remove_last_ref_clears_list() {
        let mut d = create_test_deployment("ns1", "svc-a", &["app-config"]);
        assert!(remove_config_ref(&mut d, "app-config"));
        assert!(env_from_names(&d).is_empty());
    }

    #[test]
    fn test_remove_without_match_is_noop() {
        let mut d = create_test_deployment("ns1", "svc-a", &["other"]);
        assert!(!remove_config_ref(&mut d, "app-config"));
        assert_eq!(env_from_names(&d), vec!["other"]);

        let mut empty = create_test_deployment("ns1", "svc-b", &[]);
        assert!(!remove_config_ref(&mut empty, "app-config"));
    }

    #[test]
    fn test_only_first_container_is_touched() {
        let mut d = create_test_deployment_with_sidecar("ns1", "svc-a", "proxy");
        assert!(add_config_ref(&mut d, "app-config"));
        assert_eq!(untouched_containers(&d), vec!["proxy".to_string()]);

        let sidecar = &d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[1];
        assert!(sidecar.env_from.is_none());
    }

    #[test]
    fn test_deployment_without_spec_is_left_alone() {
        let mut d = Deployment::default();
        assert!(!add_config_ref(&mut d, "app-config"));
        assert!(!remove_config_ref(&mut d, "app-config"));
        assert!(untouched_containers(&d).is_empty());
    }
}
