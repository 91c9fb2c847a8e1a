//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test objects and reading back
//! the `envFrom` state the reconciler produced.

#[cfg(test)]
use crate::env_from;
#[cfg(test)]
use k8s_openapi::api::apps::v1::Deployment;
#[cfg(test)]
use k8s_openapi::api::core::v1::ConfigMap;
#[cfg(test)]
use serde_json::json;

/// Helper to create a test Deployment whose single container already
/// references the given ConfigMaps (duplicates allowed)
#[cfg(test)]
pub fn create_test_deployment(namespace: &str, name: &str, config_refs: &[&str]) -> Deployment {
    let env_from: Vec<_> = config_refs
        .iter()
        .map(|cm| json!({ "configMapRef": { "name": cm } }))
        .collect();
    let mut container = json!({ "name": "app", "image": "nginx:1.27" });
    if !env_from.is_empty() {
        container["envFrom"] = json!(env_from);
    }
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [container] }
            }
        }
    }))
    .expect("valid deployment fixture")
}

/// Helper to create a test Deployment with an extra sidecar container
#[cfg(test)]
pub fn create_test_deployment_with_sidecar(namespace: &str, name: &str, sidecar: &str) -> Deployment {
    let mut deployment = create_test_deployment(namespace, name, &[]);
    if let Some(pod) = deployment.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
        let mut extra = pod.containers[0].clone();
        extra.name = sidecar.to_string();
        pod.containers.push(extra);
    }
    deployment
}

/// Helper to create a test ConfigMap
#[cfg(test)]
pub fn create_test_config_map(namespace: &str, name: &str) -> ConfigMap {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": { "LOG_LEVEL": "info" }
    }))
    .expect("valid configmap fixture")
}

/// ConfigMap names referenced by the first container, in order
#[cfg(test)]
pub fn env_from_names(deployment: &Deployment) -> Vec<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|c| c.env_from.as_ref())
        .map(|sources| {
            sources
                .iter()
                .filter_map(|s| s.config_map_ref.as_ref().map(|r| r.name.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Number of references to `config_map` on a Deployment
#[cfg(test)]
pub fn ref_count(deployment: &Deployment, config_map: &str) -> usize {
    env_from::count_config_refs(deployment, config_map)
}
